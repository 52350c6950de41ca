use clap::{Parser, Subcommand};
use plover_core::{
    apply_session, default_identifying_paths, CancelToken, CoreConfig, CoreError, CoreResult,
    DeidEngine, DeidMap, DeidOptions, ExportFormat, ExportOptions, ImportOptions, PathResolver,
    SessionCodec, SessionScope, SessionStore, TemplateMetadata,
};
use plover_standards::default_plugins;
use plover_types::{NonEmptyText, SemanticPath, SessionName};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "plover")]
#[command(about = "Healthcare message workbench: semantic paths, lock sessions, de-identification")]
struct Cli {
    /// Data directory (defaults to $PLOVER_DATA_DIR or ./plover_data)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Default standard when a command omits one
    #[arg(long, global = true, default_value = "hl7v23")]
    standard: String,

    /// Session time-to-live in hours; expired sessions are removed by
    /// `session cleanup`
    #[arg(long, global = true)]
    ttl_hours: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage lock sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Lock a value for a semantic path in a session
    Set {
        /// Semantic path, e.g. patient.mrn
        path: String,
        /// Value to lock
        value: String,
        /// Session to lock it in
        #[arg(long, default_value = "default")]
        session: String,
        /// Why this value was chosen
        #[arg(long)]
        reason: Option<String>,
    },
    /// Unlock a value in a session
    Unset {
        /// Semantic path, e.g. patient.mrn
        path: String,
        /// Session to unlock it in
        #[arg(long, default_value = "default")]
        session: String,
    },
    /// Inspect semantic paths
    Path {
        #[command(subcommand)]
        command: PathCommands,
    },
    /// Apply a session's locked values to a message file
    Generate {
        /// Carrier message file
        #[arg(long = "in")]
        input: PathBuf,
        /// Output file (stdout when omitted)
        #[arg(long = "out")]
        output: Option<PathBuf>,
        /// Message type, e.g. ADT_ADMIT
        message_type: String,
        #[arg(long, default_value = "default")]
        session: String,
        /// Standard override
        #[arg(long)]
        standard: Option<String>,
    },
    /// De-identify a directory of real messages
    Deident {
        /// Directory of input messages
        #[arg(long = "in")]
        input: PathBuf,
        /// Directory for de-identified output
        #[arg(long = "out")]
        output: PathBuf,
        /// Date shift, e.g. 30d or -10d (derived from the salt when omitted)
        #[arg(long)]
        date_shift: Option<String>,
        /// Salt for the identifier map (minted and recorded when omitted)
        #[arg(long)]
        salt: Option<String>,
        /// Identifying paths to scrub (defaults to the patient identifier set)
        #[arg(long = "path")]
        paths: Vec<String>,
        /// Force a standard instead of per-message detection
        #[arg(long)]
        standard: Option<String>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Create a session
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Restrict the session to these standards
        #[arg(long = "scope-standard")]
        scope_standards: Vec<String>,
        /// Restrict the session to these path prefixes
        #[arg(long = "scope-prefix")]
        scope_prefixes: Vec<String>,
        /// Replace an existing session of the same name
        #[arg(long)]
        overwrite: bool,
    },
    /// List sessions
    List,
    /// Show a session's locked values
    Show { name: String },
    /// Remove a session
    Remove { name: String },
    /// Remove expired sessions
    Cleanup,
    /// Export a session as a portable document
    Export {
        name: String,
        /// json or yaml
        #[arg(long, default_value = "yaml")]
        format: String,
        /// Output file (stdout when omitted)
        #[arg(long = "out")]
        output: Option<PathBuf>,
        /// Include creation and modification timestamps
        #[arg(long)]
        include_timestamps: bool,
        /// Omit description and scope
        #[arg(long)]
        no_metadata: bool,
        /// Compact JSON output
        #[arg(long)]
        compact: bool,
        /// Attach a template block with this name for sharing
        #[arg(long)]
        template_name: Option<String>,
        /// Template author
        #[arg(long)]
        template_author: Option<String>,
    },
    /// Import a session document
    Import {
        /// Document file; validated before anything is stored
        file: PathBuf,
        /// Store under this name instead of the document's own
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        overwrite: bool,
        /// Keep the document's timestamps instead of stamping now
        #[arg(long)]
        preserve_timestamps: bool,
        /// Only validate and report; do not store
        #[arg(long)]
        check: bool,
    },
}

#[derive(Subcommand)]
enum PathCommands {
    /// Resolve a semantic path to a field location
    Resolve {
        /// Semantic path, e.g. patient.mrn
        path: String,
        /// Message type, e.g. ADT_ADMIT
        message_type: String,
        #[arg(long)]
        standard: Option<String>,
        /// Resolve against every registered standard
        #[arg(long)]
        all_standards: bool,
    },
    /// Check whether a semantic path resolves
    Validate {
        path: String,
        message_type: String,
        #[arg(long)]
        standard: Option<String>,
    },
    /// List known paths for a message type
    List {
        message_type: String,
        #[arg(long)]
        standard: Option<String>,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error[{}]: {}", e.kind(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CoreResult<()> {
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| std::env::var_os("PLOVER_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(plover_core::constants::DEFAULT_DATA_DIR));
    let ttl = cli.ttl_hours.map(chrono::Duration::hours);
    let config = CoreConfig::new(data_dir, cli.standard.as_str(), ttl)?;

    let resolver = PathResolver::with_plugins(config.default_standard(), default_plugins());
    let cancel = CancelToken::new();

    match cli.command {
        Commands::Session { command } => session_command(command, &config, &cancel),
        Commands::Set {
            path,
            value,
            session,
            reason,
        } => {
            let sessions = SessionStore::from_config(&config)?;
            let name = parse_name(&session)?;
            let path = parse_path(&path)?;
            let reason = reason
                .map(|r| NonEmptyText::new(&r).map_err(|e| CoreError::InvalidInput(e.to_string())))
                .transpose()?;

            // The default session is created on first use.
            if session == "default" && sessions.get(&name).is_err() {
                sessions.create(&name, SessionScope::unrestricted(), None, false, &cancel)?;
            }
            sessions.set_value(&name, &path, value.as_str(), reason, &cancel)?;
            println!("locked {path} = {value} in session '{name}'");
            Ok(())
        }
        Commands::Unset { path, session } => {
            let sessions = SessionStore::from_config(&config)?;
            let name = parse_name(&session)?;
            let path = parse_path(&path)?;
            sessions.remove_value(&name, &path, &cancel)?;
            println!("unlocked {path} in session '{name}'");
            Ok(())
        }
        Commands::Path { command } => path_command(command, &resolver),
        Commands::Generate {
            input,
            output,
            message_type,
            session,
            standard,
        } => {
            let sessions = SessionStore::from_config(&config)?;
            let session = sessions.get(&parse_name(&session)?)?;
            let message = read_file(&input)?;
            let generated = apply_session(
                &resolver,
                &session,
                &message,
                &message_type,
                standard.as_deref(),
            )?;
            match output {
                Some(path) => write_file(&path, &generated)?,
                None => println!("{generated}"),
            }
            Ok(())
        }
        Commands::Deident {
            input,
            output,
            date_shift,
            salt,
            paths,
            standard,
        } => deident_command(
            &config, &resolver, &cancel, input, output, date_shift, salt, paths, standard,
        ),
    }
}

fn session_command(
    command: SessionCommands,
    config: &CoreConfig,
    cancel: &CancelToken,
) -> CoreResult<()> {
    let sessions = SessionStore::from_config(config)?;

    match command {
        SessionCommands::Create {
            name,
            description,
            scope_standards,
            scope_prefixes,
            overwrite,
        } => {
            let name = parse_name(&name)?;
            let description = description
                .map(|d| NonEmptyText::new(&d).map_err(|e| CoreError::InvalidInput(e.to_string())))
                .transpose()?;
            let scope = SessionScope {
                standards: scope_standards,
                path_prefixes: scope_prefixes,
            };
            let session = sessions.create(&name, scope, description, overwrite, cancel)?;
            println!("created session '{}' at {}", session.name, session.created_at);
            Ok(())
        }
        SessionCommands::List => {
            let summaries = sessions.list()?;
            if summaries.is_empty() {
                println!("no sessions");
                return Ok(());
            }
            for summary in summaries {
                println!(
                    "{}\t{} values\tcreated {}\t{}",
                    summary.name,
                    summary.value_count,
                    summary.created_at.format("%Y-%m-%d %H:%M"),
                    summary
                        .description
                        .map(|d| d.to_string())
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        SessionCommands::Show { name } => {
            let session = sessions.get(&parse_name(&name)?)?;
            println!("session: {}", session.name);
            if let Some(description) = &session.description {
                println!("description: {description}");
            }
            println!("created: {}", session.created_at);
            for (path, locked) in &session.values {
                match &locked.reason {
                    Some(reason) => println!("  {path} = {} ({reason})", locked.value),
                    None => println!("  {path} = {}", locked.value),
                }
            }
            Ok(())
        }
        SessionCommands::Remove { name } => {
            let name = parse_name(&name)?;
            sessions.remove(&name, cancel)?;
            println!("removed session '{name}'");
            Ok(())
        }
        SessionCommands::Cleanup => {
            let report = sessions.cleanup_expired(cancel)?;
            println!("removed {} expired session(s)", report.removed);
            for (key, why) in &report.skipped {
                println!("skipped {key}: {why}");
            }
            Ok(())
        }
        SessionCommands::Export {
            name,
            format,
            output,
            include_timestamps,
            no_metadata,
            compact,
            template_name,
            template_author,
        } => {
            let codec = SessionCodec::new(&sessions);
            let format: ExportFormat = format.parse()?;
            let options = ExportOptions {
                include_metadata: !no_metadata,
                include_timestamps,
                pretty: !compact,
                template: template_name.map(|name| TemplateMetadata {
                    name,
                    author: template_author,
                    ..TemplateMetadata::default()
                }),
            };
            let document = codec.export(&parse_name(&name)?, format, &options, cancel)?;
            match output {
                Some(path) => write_file(&path, &document)?,
                None => print!("{document}"),
            }
            Ok(())
        }
        SessionCommands::Import {
            file,
            name,
            overwrite,
            preserve_timestamps,
            check,
        } => {
            let codec = SessionCodec::new(&sessions);
            if check {
                let document = read_file(&file)?;
                let report = SessionCodec::validate_document(&document, None);
                println!(
                    "{} ({} document)",
                    if report.valid { "valid" } else { "invalid" },
                    report.detected_format
                );
                for error in &report.errors {
                    println!("error: {error}");
                }
                for warning in &report.warnings {
                    println!("warning: {warning}");
                }
                if !report.valid {
                    return Err(CoreError::DocumentMalformed {
                        format: report.detected_format.name().to_owned(),
                        detail: report.errors.join("; "),
                    });
                }
                return Ok(());
            }

            let options = ImportOptions {
                rename: name.as_deref().map(parse_name).transpose()?,
                overwrite,
                preserve_timestamps,
            };
            let session = codec.import_from_file(&file, &options, cancel)?;
            println!(
                "imported session '{}' ({} values)",
                session.name,
                session.values.len()
            );
            Ok(())
        }
    }
}

fn path_command(command: PathCommands, resolver: &PathResolver) -> CoreResult<()> {
    match command {
        PathCommands::Resolve {
            path,
            message_type,
            standard,
            all_standards,
        } => {
            let path = parse_path(&path)?;
            if all_standards {
                for (standard, outcome) in resolver.resolve_all(&path, &message_type) {
                    match outcome {
                        Ok(location) => println!(
                            "{standard}: {} ({}, {})",
                            location.locator, location.data_type, location.description
                        ),
                        Err(e) => println!("{standard}: {e}"),
                    }
                }
                return Ok(());
            }

            let location = resolver.resolve(&path, &message_type, standard.as_deref())?;
            println!("{}", location.locator);
            println!("standard: {}", location.standard);
            println!("type: {}", location.data_type);
            println!("description: {}", location.description);
            if let Some(table) = &location.coding_table {
                println!("coding table: {table}");
            }
            if !location.allowed_values.is_empty() {
                println!("allowed: {}", location.allowed_values.join(", "));
            }
            Ok(())
        }
        PathCommands::Validate {
            path,
            message_type,
            standard,
        } => {
            let path = parse_path(&path)?;
            let valid = resolver.validate(&path, &message_type, standard.as_deref());
            println!("{}", if valid { "resolvable" } else { "unresolvable" });
            if !valid {
                // Non-zero exit with the structured kind, as for any failure.
                return resolver
                    .resolve(&path, &message_type, standard.as_deref())
                    .map(|_| ());
            }
            Ok(())
        }
        PathCommands::List {
            message_type,
            standard,
        } => {
            for (path, description) in resolver.list_paths(&message_type, standard.as_deref())? {
                println!("{path}\t{description}");
            }
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn deident_command(
    config: &CoreConfig,
    resolver: &PathResolver,
    cancel: &CancelToken,
    input: PathBuf,
    output: PathBuf,
    date_shift: Option<String>,
    salt: Option<String>,
    paths: Vec<String>,
    standard: Option<String>,
) -> CoreResult<()> {
    let identifying_paths = if paths.is_empty() {
        default_identifying_paths()
    } else {
        paths
            .iter()
            .map(|p| parse_path(p))
            .collect::<CoreResult<Vec<_>>>()?
    };
    let date_shift_days = date_shift.as_deref().map(parse_date_shift).transpose()?;

    let map = DeidMap::from_config(config, salt)?;
    let mut engine = DeidEngine::new(
        resolver,
        map,
        DeidOptions {
            identifying_paths,
            date_shift_days,
            standard,
        },
    );

    std::fs::create_dir_all(&output).map_err(io_error)?;
    let mut entries: Vec<PathBuf> = std::fs::read_dir(&input)
        .map_err(io_error)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    let mut processed = 0usize;
    let mut flagged = 0usize;
    for file in entries {
        cancel.checkpoint()?;
        let message = read_file(&file)?;
        let outcome = engine.deidentify_message(&message, cancel)?;

        let target = output.join(file.file_name().expect("read_dir yields named files"));
        write_file(&target, &outcome.message)?;
        processed += 1;

        if !outcome.warnings.is_empty() {
            flagged += 1;
            for warning in &outcome.warnings {
                tracing::warn!(file = %file.display(), "{warning}");
            }
        }
    }

    engine.persist(cancel)?;
    println!(
        "de-identified {processed} message(s) ({} identifier(s) mapped, shift {} day(s), {flagged} flagged for review)",
        engine.map().len(),
        engine.offset_days(),
    );
    Ok(())
}

/// Parses a date shift such as `30d`, `-10d`, or a bare day count.
fn parse_date_shift(value: &str) -> CoreResult<i64> {
    let trimmed = value.trim().trim_end_matches('d');
    trimmed.parse::<i64>().map_err(|_| {
        CoreError::InvalidInput(format!(
            "invalid date shift '{value}' (expected e.g. 30d or -10d)"
        ))
    })
}

fn parse_name(name: &str) -> CoreResult<SessionName> {
    SessionName::parse(name).map_err(|e| CoreError::InvalidInput(e.to_string()))
}

fn parse_path(path: &str) -> CoreResult<SemanticPath> {
    SemanticPath::parse(path).map_err(|e| CoreError::InvalidInput(e.to_string()))
}

fn read_file(path: &std::path::Path) -> CoreResult<String> {
    std::fs::read_to_string(path).map_err(io_error)
}

fn write_file(path: &std::path::Path, contents: &str) -> CoreResult<()> {
    std::fs::write(path, contents).map_err(io_error)
}

fn io_error(e: std::io::Error) -> CoreError {
    CoreError::Storage(plover_store::StoreError::Io(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_shift_accepts_suffixed_and_bare_forms() {
        assert_eq!(parse_date_shift("30d").unwrap(), 30);
        assert_eq!(parse_date_shift("-10d").unwrap(), -10);
        assert_eq!(parse_date_shift("7").unwrap(), 7);
        assert!(parse_date_shift("soon").is_err());
    }

    #[test]
    fn cli_parses_spec_surface() {
        Cli::try_parse_from(["plover", "session", "create", "demo"]).unwrap();
        Cli::try_parse_from(["plover", "set", "patient.mrn", "TEST123", "--session", "demo"])
            .unwrap();
        Cli::try_parse_from([
            "plover", "path", "resolve", "patient.mrn", "ADT_ADMIT", "--standard", "hl7v23",
        ])
        .unwrap();
        Cli::try_parse_from([
            "plover", "path", "resolve", "patient.mrn", "ADT_ADMIT", "--all-standards",
        ])
        .unwrap();
        Cli::try_parse_from([
            "plover", "deident", "--in", "a", "--out", "b", "--date-shift", "30d",
        ])
        .unwrap();
    }
}
