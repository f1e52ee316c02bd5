use std::{path::PathBuf, str::FromStr};

use bincode::{Decode, Encode};
use ndview::MmapMode;
use thiserror::Error;

/// Default threshold above which forwarded arrays are dumped to backing
/// files.
pub const DEFAULT_MAX_NBYTES: u64 = 1 << 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    MmapMode(#[from] ndview::mmap::ParseMmapModeError),
    #[error("unknown prewarm setting {0:?} (expected true, false or auto)")]
    Prewarm(String),
}

/// Page-cache priming policy for freshly dumped backing files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum Prewarm {
    Always,
    Never,
    /// Prime unless the pool folder lives on a shared-memory filesystem,
    /// where the pages are resident already and an extra read only adds
    /// memory pressure.
    #[default]
    Auto,
}

impl FromStr for Prewarm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "true" => Ok(Prewarm::Always),
            "false" => Ok(Prewarm::Never),
            "auto" => Ok(Prewarm::Auto),
            _ => Err(ConfigError::Prewarm(s.to_owned())),
        }
    }
}

/// Options accepted by the reducer factory and the temporary-resources
/// manager.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Memmap threshold, strict: an array of exactly `max_nbytes` stays
    /// inline. `None` disables memmapping entirely.
    pub max_nbytes: Option<u64>,
    pub mmap_mode: MmapMode,
    /// Overrides temp-root resolution when set.
    pub temp_folder_root: Option<PathBuf>,
    pub prewarm: Prewarm,
    /// Give every shipped view a finalizer that drops one reference to its
    /// backing file, so long-lived workers release disk space early.
    pub unlink_on_gc_collect: bool,
    pub verbose: u32,
    /// Auto-generated when absent.
    pub context_id: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_nbytes: Some(DEFAULT_MAX_NBYTES),
            mmap_mode: MmapMode::Read,
            temp_folder_root: None,
            prewarm: Prewarm::Auto,
            unlink_on_gc_collect: true,
            verbose: 0,
            context_id: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prewarm_parsing() {
        assert_eq!("auto".parse::<Prewarm>().unwrap(), Prewarm::Auto);
        assert_eq!("true".parse::<Prewarm>().unwrap(), Prewarm::Always);
        assert_eq!("false".parse::<Prewarm>().unwrap(), Prewarm::Never);
        assert!("warm".parse::<Prewarm>().is_err());
    }

    #[test]
    fn defaults() {
        let options = TransportOptions::default();
        assert_eq!(options.max_nbytes, Some(1 << 20));
        assert_eq!(options.mmap_mode, MmapMode::Read);
        assert!(options.unlink_on_gc_collect);
    }
}
