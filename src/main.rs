//! syncbox client: log on to a syncbox daemon and reconcile a local directory
//! with the account's server area.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use syncbox::cli::{ClientOpts, Command};
use syncbox::client::Client;
use syncbox::config::{self, ClientConfig};
use syncbox::inventory::FileInventory;
use syncbox::logger::{Logger, NoopLogger, TextLogger};
use syncbox::progress::SyncProgress;
use syncbox::sync;

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();

    if let Err(e) = run().await {
        eprintln!("syncbox: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let opts = ClientOpts::parse();
    let mut cfg: ClientConfig = config::load(opts.config.as_deref())?;
    opts.apply(&mut cfg);
    cfg.validate()?;

    let logger: Box<dyn Logger> = match &cfg.journal {
        Some(path) => Box::new(
            TextLogger::new(path).with_context(|| format!("open journal {}", path.display()))?,
        ),
        None => Box::new(NoopLogger),
    };

    let username = match &opts.user {
        Some(user) => user.clone(),
        None => prompt("Username: ")?,
    };
    let password = match &opts.password {
        Some(password) => password.clone(),
        None => prompt("Password: ")?,
    };

    let mut client = Client::connect(&cfg)
        .await
        .with_context(|| format!("connect to {}", cfg.address()))?;
    if opts.signup {
        client.signup(&username, &password).await.context("signup")?;
        println!("Account {username} created");
    } else {
        client.logon(&username, &password).await.context("logon")?;
        println!("Logged on as {username}");
    }

    let ctx = Ctx {
        dir: &cfg.data_dir,
        server: cfg.address(),
        logger: logger.as_ref(),
        verbose: opts.verbose,
    };
    match opts.command {
        Some(command) => execute(&mut client, command, &ctx).await?,
        None => menu(&mut client, &ctx).await?,
    }

    client.leave().await.context("leave")?;
    Ok(())
}

struct Ctx<'a> {
    dir: &'a Path,
    server: String,
    logger: &'a dyn Logger,
    verbose: bool,
}

async fn execute<S>(client: &mut Client<S>, command: Command, ctx: &Ctx<'_>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match command {
        Command::List => {
            let files = client.list().await.context("list")?;
            println!("{} file(s) on server", files.len());
            print_inventory(&files);
        }
        Command::Diff => {
            let plan = sync::diff(client, ctx.dir).await?;
            if plan.is_in_sync() {
                println!("In sync");
                return Ok(());
            }
            println!("To upload ({}):", plan.missing_from_server.len());
            print_inventory(&plan.missing_from_server);
            println!("To download ({}):", plan.missing_from_client.len());
            print_inventory(&plan.missing_from_client);
        }
        Command::Sync => {
            ctx.logger.start(ctx.dir, &ctx.server);
            let progress = SyncProgress::new(0, ctx.verbose);
            let report = sync::sync(client, ctx.dir, ctx.logger, &progress).await?;
            println!(
                "Uploaded {}, downloaded {}, skipped {}",
                report.uploaded.len(),
                report.downloaded.len(),
                report.skipped.len()
            );
            for skipped in &report.skipped {
                println!("  skipped {} {}: {}", skipped.direction, skipped.name, skipped.reason);
            }
            for name in &report.changed_on_server {
                println!("  {name} changed on the server while syncing");
            }
        }
    }
    Ok(())
}

async fn menu<S>(client: &mut Client<S>, ctx: &Ctx<'_>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        println!();
        println!("1) List server files");
        println!("2) Show differences");
        println!("3) Sync");
        println!("4) Quit");
        let Some(choice) = read_line("> ")? else {
            return Ok(());
        };
        let command = match choice.trim() {
            "1" => Command::List,
            "2" => Command::Diff,
            "3" => Command::Sync,
            "4" => return Ok(()),
            other => {
                println!("Unknown choice {other:?}");
                continue;
            }
        };
        execute(client, command, ctx).await?;
    }
}

fn print_inventory(files: &FileInventory) {
    for entry in files {
        println!("  {:08x}  {}", entry.checksum, entry.name);
    }
}

/// One line from stdin; `None` at end of input
fn read_line(label: &str) -> Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn prompt(label: &str) -> Result<String> {
    match read_line(label)? {
        Some(value) if !value.is_empty() => Ok(value),
        _ => bail!("no {} given", label.trim_end_matches([':', ' ']).to_lowercase()),
    }
}
