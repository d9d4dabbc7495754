//! `imgbundle login` command - Store registry credentials.

use clap::Args;
use imgbundle_core::config::BundleConfig;
use imgbundle_runtime::oci::CredentialStore;

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server (default: index.docker.io)
    pub server: Option<String>,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

pub async fn execute(
    args: LoginArgs,
    config: &BundleConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = args.server.unwrap_or_else(|| "index.docker.io".to_string());

    let username = match args.username {
        Some(u) => u,
        None => {
            eprint!("Username: ");
            read_line()?
        }
    };
    if !args.password_stdin {
        eprint!("Password: ");
    }
    let password = read_line()?;

    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".into());
    }

    let store = match &config.registry.credentials_path {
        Some(path) => CredentialStore::new(path.clone()),
        None => CredentialStore::default_path()?,
    };
    store.store(&server, &username, &password)?;

    println!("Login Succeeded");
    Ok(())
}

fn read_line() -> std::io::Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
