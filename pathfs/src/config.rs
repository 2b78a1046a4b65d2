//! Command line and mount option handling.
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rfuse3::MountOptions;
use thiserror::Error;

pub const DEFAULT_FS_NAME: &str = "pathfs";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("mount option `{0}` requires a value")]
    MissingValue(&'static str),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Host directory named by BACKING
    #[default]
    Dir,
    /// Volatile in-memory tree; BACKING is ignored
    Memory,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Expose a path-based storage engine through FUSE")]
pub struct Args {
    /// Mount options, comma separated; anything not handled here goes to the mount verbatim
    #[arg(short = 'o', value_delimiter = ',')]
    pub options: Vec<String>,

    /// Storage engine serving the mount
    #[arg(long, value_enum, default_value_t = EngineKind::Dir)]
    pub engine: EngineKind,

    /// Mount through /dev/fuse directly instead of fusermount3
    #[arg(long, default_value_t = false)]
    pub privileged: bool,

    /// Path to mount point
    pub mountpoint: PathBuf,

    /// Backing location handed to the storage engine
    pub backing: PathBuf,
}

/// Protocol-level mount settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountConfig {
    pub fs_name: String,
    pub allow_other: bool,
    pub allow_root: bool,
    pub nonempty: bool,
    pub read_only: bool,
    pub default_permissions: bool,
    pub privileged: bool,
    /// Options passed through unmodified, in command line order.
    pub passthrough: Vec<String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_name: DEFAULT_FS_NAME.to_owned(),
            allow_other: false,
            allow_root: false,
            nonempty: false,
            read_only: false,
            default_permissions: false,
            privileged: false,
            passthrough: Vec::new(),
        }
    }
}

impl MountConfig {
    /// Parse `-o` style options. Empty items are skipped and unrecognized ones are kept for
    /// the mount as written.
    pub fn from_options<I, S>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = MountConfig::default();
        for option in options {
            let option = option.as_ref().trim();
            match option.split_once('=') {
                Some(("fsname", "")) => return Err(ConfigError::MissingValue("fsname")),
                Some(("fsname", name)) => config.fs_name = name.to_owned(),
                Some(_) => config.passthrough.push(option.to_owned()),
                None => match option {
                    "" => {}
                    "allow_other" => config.allow_other = true,
                    "allow_root" => config.allow_root = true,
                    "nonempty" => config.nonempty = true,
                    "ro" => config.read_only = true,
                    "rw" => config.read_only = false,
                    "default_permissions" => config.default_permissions = true,
                    "fsname" => return Err(ConfigError::MissingValue("fsname")),
                    other => config.passthrough.push(other.to_owned()),
                },
            }
        }
        Ok(config)
    }

    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = Self::from_options(&args.options)?;
        config.privileged = args.privileged;
        Ok(config)
    }

    /// Options for the FUSE session, owned by the calling user.
    pub fn mount_options(&self) -> MountOptions {
        let mut mo = MountOptions::default();
        mo.fs_name(self.fs_name.as_str())
            .uid(nix::unistd::getuid().as_raw())
            .gid(nix::unistd::getgid().as_raw())
            .allow_other(self.allow_other)
            .allow_root(self.allow_root)
            .nonempty(self.nonempty)
            .read_only(self.read_only)
            .default_permissions(self.default_permissions);
        if let Some(custom) = self.custom_options() {
            mo.custom_options(custom);
        }
        mo
    }

    /// Pass-through options joined the way the mount option string expects them.
    pub fn custom_options(&self) -> Option<String> {
        (!self.passthrough.is_empty()).then(|| self.passthrough.join(","))
    }
}
