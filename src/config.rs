//! Implements the explorer configuration builder and the command-line parser.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::*;
use crate::search::PrefixGroupSet;

/// Structure that contains the different configuration options for the explorer.
///
/// # Example
///
/// ```
/// use insnprobe::config::Config;
///
/// // Allows one prefix per candidate and stops after 1000 probes.
/// let config = Config::builder()
///     .prefixes(1)
///     .stop_after(Some(1000))
///     .decoder(false)
///     .build();
/// assert_eq!(config.prefixes(), 1);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Maximum number of legacy prefix bytes in a candidate.
    pub(crate) prefixes: usize,
    /// Number of probes after which the search stops. Runs until exhaustion if set to `None`.
    pub(crate) stop_after: Option<u64>,
    /// Prefix groups candidates may contain.
    pub(crate) used_prefixes: PrefixGroupSet,
    /// Prefix groups that are recognized as prefixes at all.
    pub(crate) detect_prefixes: PrefixGroupSet,
    /// Cross-checks reported lengths with the disassembler if set to `true`.
    pub(crate) decoder: bool,
    /// Runs the start-up self tests if set to `true`.
    pub(crate) self_test: bool,
    /// Directory where fatal reports are stored. Reports are only printed if set to `None`.
    pub(crate) report_directory: Option<PathBuf>,
}

impl Config {
    /// Creates a new builder instance for the explorer's configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Parses a boot-style command line made of whitespace-separated `key=value` tokens.
    ///
    /// Unknown keys and tokens without a value are ignored. Numbers are either decimal or
    /// `0x`-prefixed hexadecimal.
    pub fn from_cmdline(cmdline: &str) -> Result<Self> {
        let re = Regex::new(r"(?:^|\s)([A-Za-z_][A-Za-z0-9_]*)=(\S*)")
            .map_err(|e| ConfigError::Generic(e.to_string()))?;
        let mut builder = Self::builder();
        for cap in re.captures_iter(cmdline) {
            let (key, value) = (&cap[1], &cap[2]);
            if value.is_empty() {
                continue;
            }
            builder = match key {
                "prefixes" => builder.prefixes(parse_number(key, value)? as usize),
                "stop_after" => match parse_number(key, value)? {
                    0 => builder.stop_after(None),
                    n => builder.stop_after(Some(n)),
                },
                "used_prefixes" => {
                    builder.used_prefixes(PrefixGroupSet::from_bits(parse_number(key, value)?))
                }
                "detect_prefixes" => {
                    builder.detect_prefixes(PrefixGroupSet::from_bits(parse_number(key, value)?))
                }
                "decoder" => builder.decoder(parse_number(key, value)? != 0),
                "self_test" => builder.self_test(parse_number(key, value)? != 0),
                "report_dir" => builder.report_directory(value),
                _ => builder,
            };
        }
        Ok(builder.build())
    }

    /// Maximum number of prefix bytes per candidate.
    pub fn prefixes(&self) -> usize {
        self.prefixes
    }

    /// Probe count ceiling.
    pub fn stop_after(&self) -> Option<u64> {
        self.stop_after
    }

    /// Prefix groups that may appear in candidates.
    pub fn used_prefixes(&self) -> PrefixGroupSet {
        self.used_prefixes
    }

    /// Prefix groups recognized as prefixes.
    pub fn detect_prefixes(&self) -> PrefixGroupSet {
        self.detect_prefixes
    }

    /// Whether the disassembler cross-check is enabled.
    pub fn decoder(&self) -> bool {
        self.decoder
    }

    /// Whether self tests run at start-up.
    pub fn self_test(&self) -> bool {
        self.self_test
    }

    /// Where fatal reports are stored.
    pub fn report_directory(&self) -> Option<&Path> {
        self.report_directory.as_deref()
    }
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
fn parse_number(key: &str, value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()).into())
}

/// Configuration builder.
pub struct ConfigBuilder {
    /// The inner configuration object.
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new configuration builder.
    fn new() -> Self {
        Self {
            config: Config {
                prefixes: 0,
                stop_after: None,
                used_prefixes: PrefixGroupSet::ALL,
                detect_prefixes: PrefixGroupSet::ALL,
                decoder: true,
                self_test: true,
                report_directory: None,
            },
        }
    }

    /// Returns the [`Config`] object built with the current [`ConfigBuilder`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Sets the maximum number of prefix bytes per candidate.
    pub fn prefixes(mut self, prefixes: usize) -> Self {
        self.config.prefixes = prefixes;
        self
    }

    /// Sets the number of probes after which the search stops.
    pub fn stop_after(mut self, stop_after: Option<u64>) -> Self {
        self.config.stop_after = stop_after;
        self
    }

    /// Sets the prefix groups candidates may contain.
    pub fn used_prefixes(mut self, used_prefixes: PrefixGroupSet) -> Self {
        self.config.used_prefixes = used_prefixes;
        self
    }

    /// Sets the prefix groups recognized as prefixes.
    pub fn detect_prefixes(mut self, detect_prefixes: PrefixGroupSet) -> Self {
        self.config.detect_prefixes = detect_prefixes;
        self
    }

    /// Enables the disassembler cross-check if set to `true`.
    pub fn decoder(mut self, decoder: bool) -> Self {
        self.config.decoder = decoder;
        self
    }

    /// Enables start-up self tests if set to `true`.
    pub fn self_test(mut self, self_test: bool) -> Self {
        self.config.self_test = self_test;
        self
    }

    /// Sets the directory where fatal reports are stored.
    pub fn report_directory(mut self, report_directory: impl AsRef<Path>) -> Self {
        self.config.report_directory = Some(report_directory.as_ref().to_owned());
        self
    }
}
