//! net-transfer CLI - Main Entry Point
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CLI Application                                 │
//! │  ┌──────┐  ┌────────┐  ┌───────┐  ┌──────┐  ┌──────────┐  ┌────────┐    │
//! │  │ cert │  │ server │  │ shell │  │ list │  │ download │  │ upload │    │
//! │  └──────┘  └────────┘  └───────┘  └──────┘  └──────────┘  └────────┘    │
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    TLS Layer (rustls, mutual auth)                  ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    Session Protocol                                 ││
//! │  │  - Line framing                 - Upload approval                   ││
//! │  │  - Exact-length payloads        - SHA-256 verification              ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use net_transfer::catalog::{DirectoryCatalog, FileCatalog};
use net_transfer::client::{Client, ClientConfig, ClientSession};
use net_transfer::prompt::{parse_menu_choice, prompt_line, ConsoleSelector, MenuChoice};
use net_transfer::protocol::{format_size, DownloadOutcome, TransferError, UploadOutcome};
use net_transfer::server::{ApprovalPolicy, Server, ServerConfig, DEFAULT_PORT};
use net_transfer::tls::{
    generate_self_signed_cert, ClientIdentity, ClientTlsConfig, ServerTlsConfig,
};

/// File transfer over mutually authenticated TLS
///
/// Files are listed, downloaded and uploaded over a line-based session
/// protocol and verified with SHA-256 after every transfer.
#[derive(Parser)]
#[command(name = "ntx")]
#[command(version)]
#[command(about = "File transfer over mutually authenticated TLS", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate management commands
    Cert {
        #[command(subcommand)]
        action: CertCommands,
    },

    /// Start the file transfer server
    Server {
        /// Address to bind to
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        bind: SocketAddr,

        /// Path to the server certificate (PEM); a throwaway one is generated if omitted
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// Path to the server private key (PEM)
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,

        /// CA bundle client certificates must chain to; any client certificate otherwise
        #[arg(long)]
        client_ca: Option<PathBuf>,

        /// Directory offered for download and receiving uploads
        #[arg(short, long, default_value = "./storage")]
        storage: PathBuf,

        /// Maximum upload size in MB
        #[arg(long, default_value_t = 1024)]
        max_size: u64,

        /// How incoming uploads are approved
        #[arg(long, value_enum, default_value_t = Approve::Prompt)]
        approve: Approve,

        /// End each session after one transfer
        #[arg(long)]
        single_shot: bool,

        /// Seconds allowed for the handshake and each protocol step (0 disables)
        #[arg(long, default_value_t = 30)]
        io_timeout: u64,

        /// Seconds to wait for a client's next request
        #[arg(long)]
        idle_timeout: Option<u64>,
    },

    /// Interactive session: download or upload files from a menu
    Shell {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// List files on the server
    List {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Download a file from the server
    Download {
        #[command(flatten)]
        connect: ConnectArgs,

        /// File name as listed by the server
        name: String,

        /// Destination directory
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },

    /// Upload a file to the server
    Upload {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Local file to upload
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Generate a self-signed certificate
    Generate {
        /// Output directory for certificate and key
        #[arg(short, long, default_value = "./certs")]
        output: PathBuf,

        /// Common name for the certificate
        #[arg(long, default_value = "localhost")]
        cn: String,

        /// Additional DNS names (comma-separated)
        #[arg(long)]
        dns: Option<String>,

        /// Additional IP addresses (comma-separated)
        #[arg(long)]
        ip: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Approve {
    Prompt,
    Always,
    Never,
}

impl From<Approve> for ApprovalPolicy {
    fn from(approve: Approve) -> Self {
        match approve {
            Approve::Prompt => ApprovalPolicy::Prompt,
            Approve::Always => ApprovalPolicy::Always,
            Approve::Never => ApprovalPolicy::Never,
        }
    }
}

#[derive(Args)]
struct ConnectArgs {
    /// Server address
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    server: SocketAddr,

    /// Server hostname for TLS verification
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Path to CA certificate for server verification
    #[arg(long, conflicts_with = "insecure")]
    ca: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE!)
    #[arg(long)]
    insecure: bool,

    /// Client certificate (PEM); a throwaway one is generated if omitted
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Seconds allowed for connecting and each protocol step (0 disables)
    #[arg(long, default_value_t = 30)]
    io_timeout: u64,

    /// Seconds to wait for the server to approve an upload
    #[arg(long)]
    approval_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Cert { action } => handle_cert_command(action),
        Commands::Server {
            bind,
            cert,
            key,
            client_ca,
            storage,
            max_size,
            approve,
            single_shot,
            io_timeout,
            idle_timeout,
        } => {
            let tls_config = match (cert, key) {
                (Some(cert), Some(key)) => {
                    ServerTlsConfig::from_files(&cert, &key, client_ca.as_deref())?
                }
                _ => {
                    info!("🔐 Generating ephemeral server certificate...");
                    ServerTlsConfig::ephemeral("localhost", client_ca.as_deref())?
                }
            };

            let config = ServerConfig {
                bind_addr: bind,
                storage_dir: storage,
                tls_config,
                max_file_size: max_size.saturating_mul(1000 * 1000),
                io_timeout: seconds(io_timeout),
                idle_timeout: idle_timeout.and_then(seconds),
                single_shot,
                approval: approve.into(),
            };

            info!("🚀 Starting file transfer server...");
            Server::new(config).run().await
        }
        Commands::Shell { connect } => run_shell(connect).await,
        Commands::List { connect } => run_list(connect).await,
        Commands::Download { connect, name, dir } => run_download(connect, &name, &dir).await,
        Commands::Upload { connect, file } => run_upload(connect, &file).await,
    }
}

/// Zero disables a timeout
fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

fn handle_cert_command(action: CertCommands) -> Result<()> {
    match action {
        CertCommands::Generate {
            output,
            cn,
            dns,
            ip,
        } => {
            info!("🔐 Generating self-signed certificate...");

            let dns_names: Vec<String> = dns
                .as_deref()
                .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
                .unwrap_or_else(|| vec![cn.clone()]);
            let dns_refs: Vec<&str> = dns_names.iter().map(|s| s.as_str()).collect();

            let ip_addrs: Vec<IpAddr> = match ip.as_deref() {
                Some(list) => list
                    .split(',')
                    .map(|ip| {
                        ip.trim()
                            .parse::<IpAddr>()
                            .with_context(|| format!("Invalid IP address: {}", ip))
                    })
                    .collect::<Result<_>>()?,
                None => vec![IpAddr::from([127, 0, 0, 1])],
            };

            let cert = generate_self_signed_cert(&cn, &dns_refs, &ip_addrs)?;
            let (cert_path, key_path) = cert.save(&output)?;

            info!("✅ Certificate generated successfully!");
            info!("📝 Usage:");
            info!("   Server: ntx server --cert {:?} --key {:?}", cert_path, key_path);
            info!("   Client: ntx shell --ca {:?}", cert_path);

            Ok(())
        }
    }
}

fn connect_client(args: &ConnectArgs) -> Result<Client> {
    let identity = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => ClientIdentity::from_files(cert, key)?,
        _ => ClientIdentity::ephemeral("net-transfer-client")?,
    };

    let tls_config = if args.insecure {
        ClientTlsConfig::insecure(&args.hostname, Some(identity))?
    } else {
        ClientTlsConfig::new(args.ca.as_deref(), &args.hostname, Some(identity))?
    };

    Ok(Client::new(ClientConfig {
        server_addr: args.server,
        tls_config,
        io_timeout: seconds(args.io_timeout),
        approval_timeout: args.approval_timeout.and_then(seconds),
        show_progress: true,
    }))
}

async fn run_list(connect: ConnectArgs) -> Result<()> {
    let client = connect_client(&connect)?;
    let files = client.connect().await?.list().await?;

    if files.is_empty() {
        info!("📁 No files found");
    } else {
        info!("📁 Files on server:");
        for (i, name) in files.iter().enumerate() {
            println!("{:>4}: {}", i + 1, name);
        }
    }

    Ok(())
}

async fn run_download(connect: ConnectArgs, name: &str, dir: &Path) -> Result<()> {
    let client = connect_client(&connect)?;
    let catalog = DirectoryCatalog::new(dir);

    let mut session = client.connect().await?;
    match session.download_named(&catalog, name).await? {
        DownloadOutcome::Completed(descriptor) => {
            info!(
                "✅ Downloaded {} ({}) into {:?}",
                descriptor.name,
                format_size(descriptor.size),
                catalog.root()
            );
            Ok(())
        }
        DownloadOutcome::Cancelled => bail!("{} is not offered by the server", name),
    }
}

async fn run_upload(connect: ConnectArgs, file: &Path) -> Result<()> {
    let name = file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("Not a file name: {:?}", file))?;
    let dir = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let client = connect_client(&connect)?;
    let catalog = DirectoryCatalog::new(dir);

    let mut session = client.connect().await?;
    match session.upload(&catalog, name).await? {
        UploadOutcome::Accepted(descriptor) => {
            info!("✅ Uploaded {} ({})", descriptor.name, format_size(descriptor.size));
            Ok(())
        }
        UploadOutcome::Rejected { name, .. } => bail!("Upload of {} rejected by server", name),
    }
}

/// Menu loop over one session, reconnecting after the session was closed
async fn run_shell(connect: ConnectArgs) -> Result<()> {
    let client = connect_client(&connect)?;
    let catalog = DirectoryCatalog::new(std::env::current_dir().context("No current directory")?);
    let mut session: Option<ClientSession> = None;

    loop {
        println!();
        println!("1: Download a file");
        println!("2: Upload a file");
        println!("q: Quit");

        let Some(input) = prompt_line("Enter your selection: ").await? else {
            break;
        };

        let choice = match parse_menu_choice(&input) {
            Some(MenuChoice::Quit) => break,
            Some(choice) => choice,
            None => {
                println!("Invalid selection");
                continue;
            }
        };

        if !session.as_ref().map_or(false, |s| s.is_open()) {
            match client.connect().await {
                Ok(connected) => session = Some(connected),
                Err(e) => {
                    error!("❌ {:#}", e);
                    continue;
                }
            }
        }
        let Some(active) = session.as_mut() else {
            continue;
        };

        let result = match choice {
            MenuChoice::Download => shell_download(active, &catalog).await,
            MenuChoice::Upload => shell_upload(active, &catalog).await,
            MenuChoice::Quit => break,
        };

        match result {
            Ok(()) => {}
            Err(e @ TransferError::IntegrityMismatch { .. }) => warn!("⚠️  {}", e),
            Err(e) => error!("❌ {}", e),
        }
    }

    println!();
    println!("Goodbye!");
    Ok(())
}

async fn shell_download(
    session: &mut ClientSession,
    catalog: &DirectoryCatalog,
) -> Result<(), TransferError> {
    match session.download(catalog, &mut ConsoleSelector).await? {
        DownloadOutcome::Completed(descriptor) => info!(
            "✅ {} ({}) received and verified",
            descriptor.name,
            format_size(descriptor.size)
        ),
        DownloadOutcome::Cancelled => info!("No file selected"),
    }
    Ok(())
}

async fn shell_upload(
    session: &mut ClientSession,
    catalog: &DirectoryCatalog,
) -> Result<(), TransferError> {
    let files = catalog.list_files().await?;
    println!("Files in current directory:");
    for name in &files {
        println!("  {}", name);
    }

    let name = match prompt_line("Enter the file name to upload: ").await {
        Ok(Some(name)) if !name.trim().is_empty() => name.trim().to_string(),
        Ok(_) => return Ok(()),
        Err(e) => {
            return Err(TransferError::LocalIo {
                context: "failed to read file name".to_string(),
                source: e,
            })
        }
    };

    match session.upload(catalog, &name).await? {
        UploadOutcome::Accepted(descriptor) => info!(
            "✅ {} ({}) uploaded",
            descriptor.name,
            format_size(descriptor.size)
        ),
        UploadOutcome::Rejected { name, .. } => info!("🚫 Upload of {} rejected by server", name),
    }
    Ok(())
}
