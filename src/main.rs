use colored::Colorize;

#[tokio::main]
async fn main() {
    if let Err(e) = vm_lifecycle_manager::cli::run().await {
        eprintln!("{} {:#}", "✗".red(), e);
        std::process::exit(1);
    }
}
