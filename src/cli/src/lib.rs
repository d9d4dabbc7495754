//! imgbundle CLI - push, pull and copy image bundles.

pub mod commands;
