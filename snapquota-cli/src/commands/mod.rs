use crate::cli::Commands;
use anyhow::Result;

pub mod check;
pub mod run;

/// Dispatch command to appropriate handler
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => run::execute(args).await,
        Commands::Check(args) => check::execute(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn print_version() {
    println!("snapquota {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Enforces:");
    println!("  • project quotas on overlay upper and work directories");
    println!("  • optional quota on the merged rootfs");
    println!("  • sizes from ephemeral-storage or a custom resource");
}
