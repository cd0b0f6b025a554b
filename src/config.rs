/*!
 * Configuration handling for kvbackup
 *
 * Command-line flags override the preferences file. The home directory
 * falls back to the user's home when neither sets it.
 */

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lock::DEFAULT_LOCK_FILE;
use crate::pipeline::Transform;
use crate::store::{Account, DEFAULT_REQUEST_TIMEOUT};
use crate::utils::split_list;
use crate::{bail, ensure, error};

/// Default ledger file name
pub const DEFAULT_LEDGER_FILE: &str = "data.dat";

/// Preferences file name looked up in the working and config directories
pub const PREFERENCES_FILE: &str = "preferences.toml";

/// Command-line arguments for kvbackup
#[derive(Parser, Debug, Clone)]
#[clap(
    name = "kvbackup",
    version = env!("CARGO_PKG_VERSION"),
    about = "Deduplicating backups to Cloudflare Workers KV",
    long_about = "Backs up files under the home directory to a Workers KV namespace. Identical content is stored once; renames, moves and touches only send metadata. A local ledger records everything already sent."
)]
pub struct Args {
    /// Use an alternate preferences file
    #[clap(long, global = true, value_name = "FILE")]
    pub pref: Option<PathBuf>,

    /// Go through every step without touching the ledger or the network
    #[clap(long = "dry-run", alias = "dry", global = true)]
    pub dry_run: bool,

    /// Home directory; every backed up path must be inside it
    #[clap(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// More output (-v info, -vv debug, -vvv trace)
    #[clap(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Account email
    #[clap(long, global = true)]
    pub email: Option<String>,

    /// Account ID
    #[clap(long, global = true)]
    pub account: Option<String>,

    /// Workers KV namespace ID
    #[clap(long, global = true)]
    pub namespace: Option<String>,

    /// Global API key
    #[clap(long, global = true)]
    pub key: Option<String>,

    /// Scoped API token
    #[clap(long, global = true)]
    pub token: Option<String>,

    /// Compression: none, zstandard or zip
    #[clap(long, global = true)]
    pub zip: Option<String>,

    /// Ledger file
    #[clap(long, global = true, default_value = DEFAULT_LEDGER_FILE)]
    pub ledger: PathBuf,

    /// Process lock file
    #[clap(long = "lock-file", global = true, default_value = DEFAULT_LOCK_FILE)]
    pub lock_file: PathBuf,

    /// Number of files transferred in parallel
    #[clap(long, global = true, default_value = "4")]
    pub threads: usize,

    /// Seconds one store request may take, chunk upload included
    #[clap(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    #[clap(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List remote keys and their metadata
    Keys,

    /// Add remote entries missing from the local ledger
    Sync,

    /// Search the ledger by file name/path regex or hash prefix
    Search {
        /// Regular expression, or the start of a hash
        pattern: String,
    },

    /// Every ledger entry, sorted by path then modification time
    #[clap(name = "listAllFiles", alias = "list-all-files")]
    ListAllFiles,

    /// The newest entry of every file
    #[clap(name = "listRecentFiles", alias = "list-recent-files")]
    ListRecentFiles,

    /// Back up the configured locations
    Upload {
        /// Back up only these locations (comma-separated)
        #[clap(long, value_delimiter = ',')]
        location: Vec<String>,

        /// Back up these locations as well (comma-separated)
        #[clap(long = "add-location", alias = "addLocation", value_delimiter = ',')]
        add_location: Vec<String>,

        /// Glob patterns of file or directory names to skip
        #[clap(long, value_delimiter = ',')]
        ignore: Vec<String>,
    },

    /// Fetch a stored file by hash
    Download {
        /// Content or pointer hash
        hash: String,

        /// Where to write the file (default: its original name in the
        /// current directory)
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Print shell completions
    Completions {
        /// Target shell
        #[clap(value_enum)]
        shell: Shell,
    },
}

impl Command {
    /// Whether the command talks to the remote store
    pub fn needs_store(&self) -> bool {
        matches!(
            self,
            Command::Keys | Command::Sync | Command::Upload { .. } | Command::Download { .. }
        )
    }

    /// Whether the command must hold the process lock
    pub fn needs_lock(&self) -> bool {
        matches!(self, Command::Sync | Command::Upload { .. })
    }
}

/// Contents of the preferences file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Account email
    pub email: String,
    /// Account ID
    pub account: String,
    /// Namespace ID
    pub namespace: String,
    /// Global API key
    pub key: String,
    /// Scoped API token
    pub token: String,
    /// Comma-separated locations to back up
    pub location: String,
    /// Compression setting
    pub zip: String,
    /// Home directory override
    pub home: Option<PathBuf>,
}

impl Preferences {
    /// Parse a preferences file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let prefs: Preferences = toml::from_str(&contents)?;
        tracing::debug!("loaded preferences from {}", path.display());
        Ok(prefs)
    }

    /// Default lookup order: `./preferences.toml`, then the user config dir
    pub fn default_locations() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(PREFERENCES_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("kvbackup").join(PREFERENCES_FILE));
        }
        paths
    }

    /// Load `explicit` if given, otherwise the first default that exists.
    ///
    /// An explicit file that does not exist is an error; having no default
    /// file yields empty preferences.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            ensure!(
                path.is_file(),
                Config,
                "preferences file not found: {}",
                path.display()
            );
            return Self::from_file(path);
        }

        match Self::default_locations().into_iter().find(|p| p.is_file()) {
            Some(path) => Self::from_file(&path),
            None => {
                tracing::info!("no preferences file found, using command-line settings only");
                Ok(Self::default())
            }
        }
    }
}

/// Application configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Store credentials
    pub account: Account,

    /// Home directory
    pub home: PathBuf,

    /// Locations to back up, relative to home or absolute
    pub locations: Vec<PathBuf>,

    /// Name globs to skip while scanning
    pub ignore_patterns: Vec<String>,

    /// Transform applied before upload
    pub transform: Transform,

    /// Ledger file path
    pub ledger_path: PathBuf,

    /// Process lock path
    pub lock_path: PathBuf,

    /// Number of files transferred in parallel
    pub num_threads: usize,

    /// Limit for a single store request
    pub request_timeout: Duration,

    /// Report instead of writing
    pub dry_run: bool,
}

impl Config {
    /// Create configuration from command-line arguments and the preferences
    /// file they select
    pub fn from_args(args: &Args) -> Result<Self> {
        let prefs = Preferences::load(args.pref.as_deref())?;
        Self::from_parts(args, prefs)
    }

    /// Merge already loaded preferences with command-line arguments
    pub fn from_parts(args: &Args, prefs: Preferences) -> Result<Self> {
        let pick = |flag: &Option<String>, pref: String| flag.clone().unwrap_or(pref);

        let account = Account {
            email: pick(&args.email, prefs.email),
            account_id: pick(&args.account, prefs.account),
            namespace: pick(&args.namespace, prefs.namespace),
            key: pick(&args.key, prefs.key),
            token: pick(&args.token, prefs.token),
        };

        let home = args
            .home
            .clone()
            .or(prefs.home)
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                error!(
                    Config,
                    "cannot determine the home directory; pass --home or set `home`"
                )
            })?;

        let mut locations: Vec<PathBuf> = split_list(&prefs.location)
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let mut ignore_patterns = Vec::new();
        if let Command::Upload {
            location,
            add_location,
            ignore,
        } = &args.command
        {
            if !location.is_empty() {
                locations = location.iter().map(PathBuf::from).collect();
            }
            locations.extend(add_location.iter().map(PathBuf::from));
            ignore_patterns = ignore.clone();
        }

        let zip = args.zip.clone().unwrap_or(prefs.zip);

        Ok(Self {
            account,
            home,
            locations,
            ignore_patterns,
            transform: Transform::from_setting(&zip),
            ledger_path: args.ledger.clone(),
            lock_path: args.lock_file.clone(),
            num_threads: args.threads,
            request_timeout: args
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            dry_run: args.dry_run,
        })
    }

    /// Validate the local part of the configuration
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.home.is_dir(),
            Config,
            "home directory not found: {}",
            self.home.display()
        );
        ensure!(self.num_threads > 0, InvalidArgument, "--threads must be at least 1");
        ensure!(
            !self.request_timeout.is_zero(),
            InvalidArgument,
            "--timeout must be at least 1 second"
        );
        if let Some(parent) = self.ledger_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                bail!(Config, "ledger directory not found: {}", parent.display());
            }
        }
        Ok(())
    }
}
