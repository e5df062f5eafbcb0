use clap::Parser;

mod agent;
mod auth;
mod cli;
mod commands;
mod config;
mod error;
mod modules;
mod platform;
mod store;
mod web;

fn main() {
    let args = cli::Args::parse();

    if let Err(e) = commands::run_command(args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
