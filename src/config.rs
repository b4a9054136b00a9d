//! Run configuration merged from the command line and a TOML file.
//!
//! # Precedence
//!
//! Command line arguments win. Anything not given on the command line
//! falls back to the file's `[arguments]` table, then to the built-in
//! defaults. Services, the mailer, and the IRC endpoint only ever come
//! from the file.
//!
//! # Configuration file
//!
//! The file lives at `~/.lichen.toml` unless `--config` points elsewhere:
//!
//! ```toml
//! [[git_services]]
//! type = "github"
//! token = "ghp_example"
//! repos = ["kedark", "kedark/testing"]
//!
//! [[git_services]]
//! type = "gerrit"
//! host = "https://review.example.org"
//! repos = ["testproject"]
//!
//! [arguments]
//! age = "older 2y 1m"
//! format = "oneline"
//!
//! [mailer]
//! server = "smtp.example.com"
//! sender = "reviewbot@example.com"
//!
//! [irc]
//! server = "irc.libera.chat"
//! port = 6667
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::aggregate::SortField;
use crate::error::HarvestError;
use crate::review::age::Age;
use crate::review::format::OutputFormat;
use crate::services::gerrit::ReviewersConfig;
use crate::services::{FetchContext, TlsPolicy};

/// Subject line used when none is configured.
pub const DEFAULT_SUBJECT: &str = "review-rot notification";

/// File name looked up under the home directory by default.
const DEFAULT_CONFIG_NAME: &str = ".lichen.toml";

/// Command line interface of the harvester.
#[derive(Debug, Parser)]
#[command(name = "lichen", version, about = "Report open reviews across code review platforms")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Only report reviews older or newer than an age, e.g. `older 2y 1m`.
    #[arg(long, value_name = "STATE DURATION", num_args = 1..)]
    pub age: Option<Vec<String>>,

    /// Report style.
    #[arg(short = 'f', long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Show each review's last comment, hiding reviews commented on within
    /// DAYS days.
    #[arg(long, value_name = "DAYS", num_args = 0..=1, default_missing_value = "0")]
    pub show_last_comment: Option<u32>,

    /// Reverse the sort order, newest first.
    #[arg(long)]
    pub reverse: bool,

    /// Sort key for the report.
    #[arg(long, value_enum)]
    pub sort: Option<SortField>,

    /// Log debug detail.
    #[arg(long)]
    pub debug: bool,

    /// Email the report to these addresses.
    #[arg(long, value_name = "ADDRESS", num_args = 1..)]
    pub email: Option<Vec<String>>,

    /// Subject line for emailed reports.
    #[arg(long)]
    pub subject: Option<String>,

    /// Send the report to these IRC channels.
    #[arg(long, value_name = "CHANNEL", num_args = 1..)]
    pub irc: Option<Vec<String>>,

    /// Drop reviews whose title marks them work in progress.
    #[arg(long)]
    pub ignore_wip: bool,

    /// Skip TLS certificate verification.
    #[arg(short = 'k', long)]
    pub insecure: bool,

    /// Verify TLS against this CA bundle.
    #[arg(long, value_name = "FILE")]
    pub cacert: Option<PathBuf>,
}

impl Cli {
    /// Resolve the configuration file path, defaulting to `~/.lichen.toml`.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }
}

/// On-disk configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FileConfig {
    /// Services to harvest.
    #[serde(default)]
    pub git_services: Vec<GitServiceConfig>,
    /// Defaults for command line arguments.
    #[serde(default)]
    pub arguments: FileArguments,
    /// SMTP relay for the email sink.
    pub mailer: Option<MailerConfig>,
    /// IRC endpoint for the IRC sink.
    pub irc: Option<IrcConfig>,
}

/// One `[[git_services]]` entry, tagged by platform.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GitServiceConfig {
    /// GitHub accounts and repositories.
    Github {
        /// Personal access token, anonymous when missing.
        token: Option<String>,
        /// `owner` or `owner/repository` targets.
        #[serde(default)]
        repos: Vec<String>,
    },
    /// GitLab groups and projects on one host.
    Gitlab {
        /// Instance base URL.
        host: String,
        /// Personal access token, anonymous when missing.
        token: Option<String>,
        /// `group` or `namespace/project` targets.
        #[serde(default)]
        repos: Vec<String>,
    },
    /// Pagure repositories on pagure.io.
    Pagure {
        /// `repository` or `namespace/repository` targets.
        #[serde(default)]
        repos: Vec<String>,
    },
    /// Gerrit projects on one host.
    Gerrit {
        /// Instance base URL.
        host: String,
        /// Project targets.
        #[serde(default)]
        repos: Vec<String>,
        /// Reviewer gate for harvested changes.
        reviewers: Option<ReviewersConfig>,
    },
    /// Phabricator revisions on one instance.
    Phabricator {
        /// Conduit root or instance base URL.
        host: String,
        /// Conduit API token.
        token: String,
        /// Users whose open revisions are harvested, everyone when empty.
        #[serde(default)]
        user_names: Vec<String>,
    },
}

/// Argument defaults read from the `[arguments]` table.
///
/// List-valued options arrive as one string here, comma separated for
/// addresses and channels, whitespace separated for the age expression.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileArguments {
    /// Age filter as one string, e.g. `"older 2y 1m"`.
    pub age: Option<String>,
    /// Report style name.
    pub format: Option<String>,
    /// Show the last comment, freshness window in days.
    pub show_last_comment: Option<u32>,
    /// Reverse the sort order.
    pub reverse: Option<bool>,
    /// Sort key name.
    pub sort: Option<String>,
    /// Log debug detail.
    pub debug: Option<bool>,
    /// Addresses to email the report to, comma separated.
    pub email: Option<String>,
    /// Subject line for emailed reports.
    pub subject: Option<String>,
    /// IRC channels to notify, comma separated.
    pub irc: Option<String>,
    /// Drop work-in-progress reviews.
    pub ignore_wip: Option<bool>,
    /// Skip TLS certificate verification.
    pub insecure: Option<bool>,
    /// CA bundle path.
    pub cacert: Option<String>,
}

/// SMTP relay used by the email sink.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MailerConfig {
    /// Relay host.
    pub server: String,
    /// Sender address.
    pub sender: String,
    /// Relay port.
    #[serde(default = "default_smtp_port")]
    pub port: u16,
}

/// IRC endpoint used by the IRC sink.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IrcConfig {
    /// Server host.
    pub server: String,
    /// Server port.
    pub port: u16,
}

/// Everything one run needs, command line merged over the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    /// Services to harvest.
    pub git_services: Vec<GitServiceConfig>,
    /// Age filter tokens, unparsed.
    pub age: Option<Vec<String>>,
    /// Report style, the console default when missing.
    pub format: Option<OutputFormat>,
    /// Freshness window in days for the last-comment option.
    pub show_last_comment: Option<u32>,
    /// Reverse the sort order.
    pub reverse: bool,
    /// Sort key for the report.
    pub sort: SortField,
    /// Log debug detail.
    pub debug: bool,
    /// Addresses to email the report to.
    pub email: Option<Vec<String>>,
    /// Subject line for emailed reports.
    pub subject: String,
    /// IRC channels to notify.
    pub irc: Option<Vec<String>>,
    /// Drop work-in-progress reviews.
    pub ignore_wip: bool,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// CA bundle path.
    pub cacert: Option<PathBuf>,
    /// SMTP relay for the email sink.
    pub mailer: Option<MailerConfig>,
    /// IRC endpoint for the IRC sink.
    pub irc_endpoint: Option<IrcConfig>,
}

impl Settings {
    /// Check the combinations the sinks and formatters cannot serve.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::ConfigConflict`] for contradictory options
    /// and [`HarvestError::Configuration`] for missing sink configuration.
    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.show_last_comment.is_some() && self.format == Some(OutputFormat::Oneline) {
            return Err(HarvestError::ConfigConflict {
                message: String::from("oneline format doesn't support last comment functionality"),
            });
        }
        if self.email.is_some() && self.format.is_some() {
            return Err(HarvestError::ConfigConflict {
                message: String::from("No format should be specified when selecting email output"),
            });
        }
        if self.irc.is_some() && self.format.is_some() {
            return Err(HarvestError::ConfigConflict {
                message: String::from("No format should be specified when selecting irc output"),
            });
        }
        if self.email.is_some() && self.mailer.is_none() {
            return Err(HarvestError::Configuration {
                message: String::from(
                    "Missing mailer configuration. Check demos/sampleinput_email.toml for correct configuration.",
                ),
            });
        }
        if self.irc.is_some() && self.irc_endpoint.is_none() {
            return Err(HarvestError::Configuration {
                message: String::from(
                    "Missing irc configuration. Check demos/sampleinput_irc.toml for correct configuration.",
                ),
            });
        }
        Ok(())
    }

    /// Resolve the TLS verification policy.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::ConfigConflict`] when a CA bundle is
    /// combined with `--insecure` and [`HarvestError::Configuration`] when
    /// the bundle does not exist.
    pub fn tls_policy(&self) -> Result<TlsPolicy, HarvestError> {
        match (&self.cacert, self.insecure) {
            (Some(_), true) => Err(HarvestError::ConfigConflict {
                message: String::from("Certificate file can't be used with insecure flag"),
            }),
            (Some(path), false) => {
                if path.exists() {
                    Ok(TlsPolicy::CaBundle(path.clone()))
                } else {
                    Err(HarvestError::Configuration {
                        message: format!("No CA certificate file found at {}", path.display()),
                    })
                }
            }
            (None, true) => Ok(TlsPolicy::Insecure),
            (None, false) => Ok(TlsPolicy::Verify),
        }
    }

    /// Build the per-run fetch parameters.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::InvalidAge`] when the age expression cannot
    /// be parsed.
    pub fn fetch_context(&self, now: DateTime<Utc>) -> Result<FetchContext, HarvestError> {
        let age = match &self.age {
            Some(tokens) => Some(Age::parse(tokens, now)?),
            None => None,
        };
        Ok(FetchContext {
            age,
            show_last_comment: self.show_last_comment,
            now,
        })
    }
}

/// File shape before the service entries are checked.
#[derive(Debug, Default, Deserialize)]
struct RawFileConfig {
    #[serde(default)]
    git_services: Vec<toml::Table>,
    #[serde(default)]
    arguments: FileArguments,
    mailer: Option<MailerConfig>,
    irc: Option<IrcConfig>,
}

/// Platform names accepted in a `[[git_services]]` `type` field.
const SERVICE_TYPES: [&str; 5] = ["github", "gitlab", "pagure", "gerrit", "phabricator"];

/// Read and parse the configuration file.
///
/// # Errors
///
/// Returns [`HarvestError::Configuration`] when the file is missing, does
/// not parse, or names an unknown service type.
pub fn load_file(path: &Path) -> Result<FileConfig, HarvestError> {
    let text = std::fs::read_to_string(path).map_err(|_| HarvestError::Configuration {
        message: format!("No config file found at {}", path.display()),
    })?;
    let raw: RawFileConfig =
        toml::from_str(&text).map_err(|error| HarvestError::Configuration {
            message: format!("cannot parse config file {}: {error}", path.display()),
        })?;
    let mut git_services = Vec::with_capacity(raw.git_services.len());
    for table in raw.git_services {
        git_services.push(parse_service(table, path)?);
    }
    Ok(FileConfig {
        git_services,
        arguments: raw.arguments,
        mailer: raw.mailer,
        irc: raw.irc,
    })
}

/// Check the service tag before handing the entry to serde.
fn parse_service(table: toml::Table, path: &Path) -> Result<GitServiceConfig, HarvestError> {
    let kind = table
        .get("type")
        .and_then(toml::Value::as_str)
        .unwrap_or_default()
        .to_owned();
    if !SERVICE_TYPES.contains(&kind.as_str()) {
        return Err(HarvestError::Configuration {
            message: format!("requested git service {kind} is not valid"),
        });
    }
    toml::Value::Table(table)
        .try_into()
        .map_err(|error| HarvestError::Configuration {
            message: format!("cannot parse config file {}: {error}", path.display()),
        })
}

/// Merge command line arguments over the file's defaults.
#[must_use]
pub fn merge(cli: &Cli, file: FileConfig) -> Settings {
    let FileConfig {
        git_services,
        arguments,
        mailer,
        irc,
    } = file;
    Settings {
        git_services,
        age: cli
            .age
            .clone()
            .or_else(|| arguments.age.as_deref().map(split_whitespace_tokens)),
        format: cli
            .format
            .or_else(|| arguments.format.as_deref().and_then(parse_format)),
        show_last_comment: cli.show_last_comment.or(arguments.show_last_comment),
        reverse: cli.reverse || arguments.reverse.unwrap_or_default(),
        sort: cli
            .sort
            .or_else(|| arguments.sort.as_deref().and_then(parse_sort))
            .unwrap_or_default(),
        debug: cli.debug || arguments.debug.unwrap_or_default(),
        email: cli
            .email
            .clone()
            .or_else(|| arguments.email.as_deref().map(split_comma_list)),
        subject: cli
            .subject
            .clone()
            .or_else(|| arguments.subject.clone())
            .unwrap_or_else(|| String::from(DEFAULT_SUBJECT)),
        irc: cli
            .irc
            .clone()
            .or_else(|| arguments.irc.as_deref().map(split_comma_list)),
        ignore_wip: cli.ignore_wip || arguments.ignore_wip.unwrap_or_default(),
        insecure: cli.insecure || arguments.insecure.unwrap_or_default(),
        cacert: cli
            .cacert
            .clone()
            .or_else(|| arguments.cacert.as_deref().map(PathBuf::from)),
        mailer,
        irc_endpoint: irc,
    }
}

/// Standard SMTP port used when the mailer table omits one.
const fn default_smtp_port() -> u16 {
    25
}

/// Default configuration file location under the home directory.
fn default_config_path() -> PathBuf {
    dirs::home_dir().map_or_else(
        || PathBuf::from(DEFAULT_CONFIG_NAME),
        |home| home.join(DEFAULT_CONFIG_NAME),
    )
}

/// Parse a format name from the file, ignoring unknown values.
fn parse_format(value: &str) -> Option<OutputFormat> {
    let format = OutputFormat::from_str(value, true).ok();
    if format.is_none() {
        tracing::warn!(value, "ignoring unknown format in config file");
    }
    format
}

/// Parse a sort key name from the file, ignoring unknown values.
fn parse_sort(value: &str) -> Option<SortField> {
    let sort = SortField::from_str(value, true).ok();
    if sort.is_none() {
        tracing::warn!(value, "ignoring unknown sort in config file");
    }
    sort
}

/// Split a comma separated list, dropping blanks.
fn split_comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Split an age expression into its whitespace tokens.
fn split_whitespace_tokens(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_owned).collect()
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests panic on failure"
)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    fn bare_cli() -> Cli {
        Cli::try_parse_from(["lichen"]).expect("bare invocation should parse")
    }

    #[rstest]
    fn parses_every_service_type() {
        let text = r#"
            [[git_services]]
            type = "github"
            token = "ghp_example"
            repos = ["kedark", "kedark/testing"]

            [[git_services]]
            type = "gitlab"
            host = "https://gitlab.example"
            token = "glpat_example"
            repos = ["dream-team"]

            [[git_services]]
            type = "pagure"
            repos = ["testrepo"]

            [[git_services]]
            type = "gerrit"
            host = "https://gerrit.example"
            repos = ["testproject"]

            [git_services.reviewers]
            excluded = ["jenkins"]

            [[git_services]]
            type = "phabricator"
            host = "https://phab.example/api/"
            token = "api-example"
            user_names = ["jdoe"]

            [mailer]
            server = "smtp.example.com"
            sender = "reviewbot@example.com"

            [irc]
            server = "irc.libera.chat"
            port = 6667
        "#;
        let file: FileConfig = toml::from_str(text).expect("config should parse");

        assert_eq!(file.git_services.len(), 5);
        assert_eq!(
            file.git_services.first(),
            Some(&GitServiceConfig::Github {
                token: Some(String::from("ghp_example")),
                repos: vec![String::from("kedark"), String::from("kedark/testing")],
            })
        );
        let gerrit = file.git_services.get(3).expect("gerrit entry");
        assert!(matches!(
            gerrit,
            GitServiceConfig::Gerrit { reviewers: Some(config), .. }
                if config.excluded == vec![String::from("jenkins")] && config.ensure
        ));
        let mailer = file.mailer.expect("mailer table");
        assert_eq!(mailer.server, "smtp.example.com");
        assert_eq!(mailer.port, 25);
        let irc = file.irc.expect("irc table");
        assert_eq!(irc.port, 6667);
    }

    #[rstest]
    fn missing_config_file_names_the_path() {
        let error = load_file(Path::new("/nonexistent/.lichen.toml"))
            .expect_err("missing file should fail");
        assert_eq!(
            error,
            HarvestError::Configuration {
                message: String::from("No config file found at /nonexistent/.lichen.toml"),
            }
        );
    }

    #[rstest]
    fn loads_a_config_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        writeln!(
            file,
            "[[git_services]]\ntype = \"pagure\"\nrepos = [\"testrepo\"]"
        )
        .expect("should write temp file");

        let config = load_file(file.path()).expect("file should load");
        assert_eq!(
            config.git_services,
            vec![GitServiceConfig::Pagure {
                repos: vec![String::from("testrepo")],
            }]
        );
    }

    #[rstest]
    fn unknown_service_type_is_rejected_by_name() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        writeln!(file, "[[git_services]]\ntype = \"bitbucket\"").expect("should write temp file");

        let error = load_file(file.path()).expect_err("unknown type should fail");
        assert_eq!(
            error,
            HarvestError::Configuration {
                message: String::from("requested git service bitbucket is not valid"),
            }
        );
    }

    #[rstest]
    fn cli_accepts_multi_token_age() {
        let cli = Cli::try_parse_from(["lichen", "--age", "older", "2y", "1m"])
            .expect("age tokens should parse");
        assert_eq!(
            cli.age,
            Some(vec![
                String::from("older"),
                String::from("2y"),
                String::from("1m")
            ])
        );
    }

    #[rstest]
    fn show_last_comment_defaults_to_zero_days() {
        let bare = Cli::try_parse_from(["lichen", "--show-last-comment"])
            .expect("flag without value should parse");
        assert_eq!(bare.show_last_comment, Some(0));

        let withdays = Cli::try_parse_from(["lichen", "--show-last-comment", "7"])
            .expect("flag with value should parse");
        assert_eq!(withdays.show_last_comment, Some(7));

        assert_eq!(bare_cli().show_last_comment, None);
    }

    #[rstest]
    fn cli_format_wins_over_the_file() {
        let mut cli = bare_cli();
        cli.format = Some(OutputFormat::Json);
        let file = FileConfig {
            arguments: FileArguments {
                format: Some(String::from("indented")),
                ..FileArguments::default()
            },
            ..FileConfig::default()
        };

        let settings = merge(&cli, file);
        assert_eq!(settings.format, Some(OutputFormat::Json));
    }

    #[rstest]
    fn file_arguments_fill_cli_gaps() {
        let file = FileConfig {
            arguments: FileArguments {
                age: Some(String::from("newer  30d")),
                format: Some(String::from("indented")),
                email: Some(String::from("one@example.com, two@example.com,")),
                irc: Some(String::from("#reviews,#general")),
                sort: Some(String::from("updated")),
                reverse: Some(true),
                ..FileArguments::default()
            },
            ..FileConfig::default()
        };

        let settings = merge(&bare_cli(), file);
        assert_eq!(
            settings.age,
            Some(vec![String::from("newer"), String::from("30d")])
        );
        assert_eq!(settings.format, Some(OutputFormat::Indented));
        assert_eq!(
            settings.email,
            Some(vec![
                String::from("one@example.com"),
                String::from("two@example.com")
            ])
        );
        assert_eq!(
            settings.irc,
            Some(vec![String::from("#reviews"), String::from("#general")])
        );
        assert_eq!(settings.sort, SortField::Updated);
        assert!(settings.reverse);
    }

    #[rstest]
    fn unknown_file_choices_are_ignored() {
        let file = FileConfig {
            arguments: FileArguments {
                format: Some(String::from("fancy")),
                sort: Some(String::from("alphabetical")),
                ..FileArguments::default()
            },
            ..FileConfig::default()
        };

        let settings = merge(&bare_cli(), file);
        assert_eq!(settings.format, None);
        assert_eq!(settings.sort, SortField::Submitted);
    }

    #[rstest]
    fn subject_falls_back_to_the_default() {
        let settings = merge(&bare_cli(), FileConfig::default());
        assert_eq!(settings.subject, DEFAULT_SUBJECT);
    }

    #[rstest]
    #[case::oneline_last_comment(
        Settings {
            format: Some(OutputFormat::Oneline),
            show_last_comment: Some(0),
            ..Settings::default()
        },
        "oneline format doesn't support last comment functionality"
    )]
    #[case::email_with_format(
        Settings {
            format: Some(OutputFormat::Json),
            email: Some(vec![String::from("one@example.com")]),
            ..Settings::default()
        },
        "No format should be specified when selecting email output"
    )]
    #[case::irc_with_format(
        Settings {
            format: Some(OutputFormat::Json),
            irc: Some(vec![String::from("#reviews")]),
            ..Settings::default()
        },
        "No format should be specified when selecting irc output"
    )]
    #[case::email_without_mailer(
        Settings {
            email: Some(vec![String::from("one@example.com")]),
            ..Settings::default()
        },
        "Missing mailer configuration. Check demos/sampleinput_email.toml for correct configuration."
    )]
    #[case::irc_without_endpoint(
        Settings {
            irc: Some(vec![String::from("#reviews")]),
            ..Settings::default()
        },
        "Missing irc configuration. Check demos/sampleinput_irc.toml for correct configuration."
    )]
    fn validation_rejects_conflicts(#[case] settings: Settings, #[case] message: &str) {
        let error = settings.validate().expect_err("validation should fail");
        let text = match error {
            HarvestError::ConfigConflict { message: value }
            | HarvestError::Configuration { message: value } => value,
            other => panic!("unexpected error {other:?}"),
        };
        assert_eq!(text, message);
    }

    #[rstest]
    fn valid_settings_pass_validation() {
        let settings = Settings {
            format: Some(OutputFormat::Oneline),
            ..Settings::default()
        };
        assert_eq!(settings.validate(), Ok(()));
    }

    #[rstest]
    fn insecure_conflicts_with_a_certificate() {
        let settings = Settings {
            insecure: true,
            cacert: Some(PathBuf::from("/tmp/bundle.pem")),
            ..Settings::default()
        };
        let error = settings.tls_policy().expect_err("conflict should fail");
        assert_eq!(
            error,
            HarvestError::ConfigConflict {
                message: String::from("Certificate file can't be used with insecure flag"),
            }
        );
    }

    #[rstest]
    fn missing_certificate_names_the_path() {
        let settings = Settings {
            cacert: Some(PathBuf::from("/nonexistent/bundle.pem")),
            ..Settings::default()
        };
        let error = settings.tls_policy().expect_err("missing bundle should fail");
        assert_eq!(
            error,
            HarvestError::Configuration {
                message: String::from("No CA certificate file found at /nonexistent/bundle.pem"),
            }
        );
    }

    #[rstest]
    fn tls_policy_resolves_each_mode() {
        assert_eq!(
            Settings::default().tls_policy(),
            Ok(TlsPolicy::Verify)
        );
        let insecure = Settings {
            insecure: true,
            ..Settings::default()
        };
        assert_eq!(insecure.tls_policy(), Ok(TlsPolicy::Insecure));

        let bundle = tempfile::NamedTempFile::new().expect("should create temp file");
        let trusted = Settings {
            cacert: Some(bundle.path().to_path_buf()),
            ..Settings::default()
        };
        assert_eq!(
            trusted.tls_policy(),
            Ok(TlsPolicy::CaBundle(bundle.path().to_path_buf()))
        );
    }

    #[rstest]
    fn fetch_context_parses_the_age_expression() {
        use chrono::TimeZone;

        let now = chrono::Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap();
        let settings = Settings {
            age: Some(vec![String::from("older"), String::from("2y")]),
            show_last_comment: Some(3),
            ..Settings::default()
        };

        let context = settings.fetch_context(now).expect("age should parse");
        assert!(context.age.is_some());
        assert_eq!(context.show_last_comment, Some(3));
        assert_eq!(context.now, now);

        let invalid = Settings {
            age: Some(vec![String::from("sometime"), String::from("2y")]),
            ..Settings::default()
        };
        assert!(matches!(
            invalid.fetch_context(now),
            Err(HarvestError::InvalidAge { .. })
        ));
    }
}
