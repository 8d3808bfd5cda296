use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, ensure, Context as _, Result};
use polyfuse::{KernelConfig, Session};

use chatfs::{ChatFs, Conn};

const USAGE: &str = "\
Usage: chatfs [OPTION...] MOUNTPOINT

Mount a team-chat workspace as a filesystem.

Options:
    --token-path PATH    file containing the API token
    --offline SNAPSHOT   serve a saved JSON snapshot, with no connection
    -h, --help           print this help

The token file is resolved from --token-path, the CHATFS_TOKEN_PATH
environment variable, or ~/.chatfs-token, in that order.
";

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        print!("{}", USAGE);
        return Ok(());
    }

    let token_path: Option<PathBuf> = args.opt_value_from_str("--token-path")?;
    let offline: Option<PathBuf> = args.opt_value_from_str("--offline")?;
    let mountpoint: PathBuf = args
        .opt_free_from_str()?
        .context("missing mountpoint")?;
    ensure!(mountpoint.is_dir(), "mountpoint must be a directory");

    let conn = match offline {
        Some(snapshot) => {
            Conn::offline(&snapshot).with_context(|| format!("loading {}", snapshot.display()))?
        }
        None => {
            // The wire client ships separately; this binary only links the
            // snapshot transport. Still resolve the token so a bad setup is
            // reported first.
            let _token = load_token(token_path)?;
            bail!("no wire transport in this build; run with --offline SNAPSHOT");
        }
    };

    let session = Session::mount(mountpoint, KernelConfig::default())?;
    let fs = Arc::new(ChatFs::new(Arc::clone(&conn)));

    while let Some(req) = session.next_request()? {
        let fs = Arc::clone(&fs);
        std::thread::spawn(move || {
            if let Err(err) = fs.handle_request(&req) {
                tracing::error!(unique = req.unique(), %err, "request failed");
            }
        });
    }

    // The kernel connection is gone; release blocked readers.
    conn.shutdown();

    Ok(())
}

fn load_token(flag: Option<PathBuf>) -> Result<String> {
    let path = flag
        .or_else(|| std::env::var_os("CHATFS_TOKEN_PATH").map(PathBuf::from))
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".chatfs-token"))
        })
        .context("no token file location; pass --token-path or set CHATFS_TOKEN_PATH")?;

    let token = std::fs::read_to_string(&path)
        .with_context(|| format!("reading token file {}", path.display()))?;
    let token = token.trim().to_owned();
    ensure!(!token.is_empty(), "token file {} is empty", path.display());
    Ok(token)
}
