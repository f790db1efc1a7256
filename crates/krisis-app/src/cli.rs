use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "krisis",
    version,
    about = "News aggregation backend with asynchronous bias analysis"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API server, with an embedded analysis worker by default
    Serve(ServeArgs),
    /// Run a standalone analysis worker sharing the queue through the store
    Worker,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Serve the API only; analysis jobs are left to worker processes
    #[arg(long)]
    pub no_worker: bool,
}
