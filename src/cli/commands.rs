use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "teehee", version, about = "Teehee Chat terminal client", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the config file path globally
    #[arg(short, long, global = true, default_value = "config.yaml")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Exchange an identity-provider ID token for a backend access token
    Login {
        #[arg(long)]
        id_token: String,
    },

    /// Show the signed-in user
    Whoami,

    /// Invalidate the backend session
    Logout,

    /// Enter interactive chat REPL mode
    Chat {
        /// The id of the chat session to connect to
        #[arg(short, long)]
        session: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },

    /// Manage chat sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage provider API keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// List the providers and models the backend supports
    Models,
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// List all sessions
    List,

    /// Create a new session
    Create {
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Rename a session
    Rename { id: String, name: String },

    /// Delete a session
    Delete { id: String },

    /// Print a session's thread
    Show { id: String },

    /// Export a session to a .txt file
    Export {
        /// The id of the session to export
        id: String,
        /// The path to the output file (optional)
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Import a session from a .txt file
    Import {
        /// The path to the .txt file to import
        #[arg(short, long)]
        path: String,
    },
}

#[derive(Subcommand)]
pub enum KeyAction {
    /// List stored provider keys
    List,

    /// Store an API key for a provider
    Add {
        #[arg(short, long)]
        provider: String,
        #[arg(short, long)]
        key: String,
    },

    /// Delete a stored provider key
    Delete { id: String },
}
