// sqlmaster/crates/sqlmaster-client/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use anyhow::{bail, Context, Result};
    use clap::{Parser, Subcommand};
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

    use sqlmaster_client::{
        telemetry, AssistantEntry, ChatEntry, ClientState, Config, IngestOutcome, Row,
        TurnOutcome,
    };

    const PREVIEW_ROWS: usize = 20;

    #[derive(Parser)]
    #[command(name = "sqlmaster")]
    #[command(version)]
    #[command(about = "Ask questions about your spreadsheets in plain language")]
    struct Cli {
        #[command(subcommand)]
        command: Commands,

        /// Service base URL (overrides API_BASE_URL)
        #[arg(long, global = true)]
        base_url: Option<String>,
    }

    #[derive(Subcommand)]
    enum Commands {
        /// Sign in; the password is read from stdin
        Login { username: String },

        /// Create an account and sign in; the password is read from stdin twice
        Signup {
            username: String,
            #[arg(long)]
            email: String,
        },

        /// Forget the stored session
        Logout,

        /// Show who is signed in
        Whoami,

        /// List the ingested data sources
        Schema,

        /// Ingest a .csv/.xlsx/.xls file
        Upload {
            path: PathBuf,
            /// Source name (defaults to the file name up to its first dot)
            #[arg(long)]
            table: Option<String>,
        },

        /// Ask a single question
        Ask {
            #[arg(required = true, num_args = 1..)]
            question: Vec<String>,
            /// Sources to scope the question to if the service finds it ambiguous
            #[arg(long, value_delimiter = ',')]
            sources: Vec<String>,
            /// Write result rows to this CSV file
            #[arg(long)]
            csv: Option<PathBuf>,
        },

        /// Run SQL on the service and save the result as CSV
        ExportSql { sql: String, path: PathBuf },

        /// Interactive session
        Chat,
    }

    type InputLines = Lines<BufReader<Stdin>>;

    pub async fn run() -> Result<()> {
        telemetry::init_tracing();
        let cli = Cli::parse();

        let mut config = Config::from_env()?;
        if let Some(url) = cli.base_url {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        config.print_config();
        let state = ClientState::open(config)?;
        let mut input = BufReader::new(tokio::io::stdin()).lines();

        match cli.command {
            Commands::Login { username } => {
                let password = prompt(&mut input, "Password: ").await?;
                let session = state.session.sign_in(&username, &password).await?;
                println!("Signed in as {}", session.identity);
            }
            Commands::Signup { username, email } => {
                let password = prompt(&mut input, "Password: ").await?;
                let confirmation = prompt(&mut input, "Confirm password: ").await?;
                let session = state
                    .session
                    .sign_up(&username, &email, &password, &confirmation)
                    .await?;
                println!("Account created. Signed in as {}", session.identity);
            }
            Commands::Logout => {
                state.sign_out()?;
                println!("Signed out");
            }
            Commands::Whoami => match state.session.current_session() {
                Some(session) => println!("{}", session.identity),
                None => println!("Not signed in"),
            },
            Commands::Schema => {
                let snapshot = state.schema.refresh().await?;
                println!("{}", snapshot);
            }
            Commands::Upload { path, table } => upload(&state, &path, table.as_deref()).await?,
            Commands::Ask {
                question,
                sources,
                csv,
            } => {
                let question = question.join(" ");
                let mut outcome = state.dispatcher.ask(&question).await;
                if outcome == TurnOutcome::AmbiguityPending && !sources.is_empty() {
                    print_new_entries(&state, 0);
                    let seen = state.log.len();
                    outcome = state.dispatcher.resolve_ambiguity(&sources).await;
                    print_new_entries(&state, seen);
                } else {
                    print_new_entries(&state, 0);
                }
                report_outcome(&outcome)?;
                if let Some(path) = csv {
                    export_rows(&state, Some(&path))?;
                }
            }
            Commands::ExportSql { sql, path } => {
                let written = state.download_query_csv(&sql, Some(&path)).await?;
                println!("Saved {}", written.display());
            }
            Commands::Chat => chat(&state, &mut input).await?,
        }
        Ok(())
    }

    async fn upload(state: &ClientState, path: &Path, table: Option<&str>) -> Result<()> {
        let suggested = state
            .ingestion
            .select_path(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let source = table.unwrap_or(&suggested);
        let seen = state.log.len();
        let outcome = state.ingestion.ingest(source).await?;
        print_new_entries(state, seen);
        match outcome {
            IngestOutcome::Ingested { .. } => Ok(()),
            IngestOutcome::SessionExpired => bail!("session expired"),
            IngestOutcome::Failed { reason } => bail!(reason),
        }
    }

    async fn chat(state: &ClientState, input: &mut InputLines) -> Result<()> {
        let who = state
            .session
            .current_session()
            .map(|s| s.identity)
            .unwrap_or_else(|| "guest".to_string());
        println!("Hi {}! Ask a question, or /help for commands.", who);

        loop {
            let Some(line) = read_line(input, "> ").await? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let seen = state.log.len();
            let (command, rest) = match line.split_once(char::is_whitespace) {
                Some((c, r)) => (c, r.trim()),
                None => (line, ""),
            };

            match command {
                "/quit" | "/exit" => break,
                "/help" => print_help(),
                "/schema" => match state.schema.refresh().await {
                    Ok(snapshot) => println!("{}", snapshot),
                    Err(e) => eprintln!("{}", e),
                },
                "/upload" => {
                    let (path, table) = match rest.split_once(" as ") {
                        Some((p, t)) => (p.trim(), Some(t.trim())),
                        None => (rest, None),
                    };
                    if path.is_empty() {
                        eprintln!("usage: /upload <path> [as <source>]");
                    } else if let Err(e) = upload(state, Path::new(path), table).await {
                        eprintln!("{:#}", e);
                    }
                }
                "/pick" => {
                    for name in rest.split([',', ' ']).filter(|n| !n.is_empty()) {
                        match state.dispatcher.toggle_source(name) {
                            Some(true) => println!("  [x] {}", name),
                            Some(false) => println!("  [ ] {}", name),
                            None => eprintln!("'{}' is not one of the offered sources", name),
                        }
                    }
                }
                "/resolve" => {
                    let outcome = state.dispatcher.resolve_selected().await;
                    print_new_entries(state, seen);
                    if let Err(e) = report_outcome(&outcome) {
                        eprintln!("{}", e);
                    }
                }
                "/export" => {
                    let path = (!rest.is_empty()).then(|| PathBuf::from(rest));
                    if let Err(e) = export_rows(state, path.as_deref()) {
                        eprintln!("{:#}", e);
                    }
                }
                "/save" => {
                    let path = (!rest.is_empty()).then(|| PathBuf::from(rest));
                    match state.save_transcript(path.as_deref()) {
                        Ok(written) => println!("Saved {}", written.display()),
                        Err(e) => eprintln!("{}", e),
                    }
                }
                "/clear" => {
                    state.dispatcher.clear();
                    println!("Conversation cleared");
                }
                other if other.starts_with('/') => {
                    eprintln!("Unknown command {}. Try /help.", other)
                }
                _ => {
                    let outcome = state.dispatcher.ask(line).await;
                    print_new_entries(state, seen);
                    if let Err(e) = report_outcome(&outcome) {
                        eprintln!("{}", e);
                    }
                }
            }
        }
        Ok(())
    }

    fn print_help() {
        println!("  /upload <path> [as <source>]  ingest a spreadsheet");
        println!("  /schema                       list data sources");
        println!("  /pick <source>...             toggle sources for an ambiguous question");
        println!("  /resolve                      re-ask with the picked sources");
        println!("  /export [path]                save the latest result rows as CSV");
        println!("  /save [path]                  save the conversation as JSON");
        println!("  /clear                        start over");
        println!("  /quit");
    }

    fn report_outcome(outcome: &TurnOutcome) -> Result<()> {
        match outcome {
            TurnOutcome::Rejected(reason) => bail!("not sent: {}", reason),
            TurnOutcome::SessionExpired => bail!("session expired, run `sqlmaster login`"),
            TurnOutcome::Failed { .. } | TurnOutcome::Answered | TurnOutcome::Discarded => Ok(()),
            TurnOutcome::AmbiguityPending => Ok(()),
        }
    }

    fn export_rows(state: &ClientState, path: Option<&Path>) -> Result<()> {
        match state.export_latest_rows(path)? {
            Some(written) => println!("Saved {}", written.display()),
            None => println!("No result rows to export"),
        }
        Ok(())
    }

    fn print_new_entries(state: &ClientState, from: usize) {
        for entry in state.log.entries().iter().skip(from) {
            match entry {
                ChatEntry::User { .. } => {}
                ChatEntry::Assistant(reply) => print_reply(reply),
            }
        }
    }

    fn print_reply(reply: &AssistantEntry) {
        println!("{}", reply.content);
        if let Some(ambiguity) = &reply.ambiguity {
            println!("Candidate sources: {}", ambiguity.candidate_sources.join(", "));
            println!("Pick with /pick <source> then /resolve (or pass --sources).");
        }
        if let Some(sql) = &reply.generated_query {
            println!("\nSQL:\n  {}", sql);
        }
        if let Some(rows) = reply.result_rows.as_deref().filter(|r| !r.is_empty()) {
            println!();
            print_table(rows);
        }
        if let Some(plan) = &reply.plan {
            println!("\nPlan: {}", plan);
        }
        if let Some(reflection) = &reply.reflection {
            println!("Reflection: {}", reflection);
        }
    }

    fn print_table(rows: &[Row]) {
        let Some(first) = rows.first() else {
            return;
        };
        let header: Vec<&String> = first.keys().collect();
        let cells: Vec<Vec<String>> = rows
            .iter()
            .take(PREVIEW_ROWS)
            .map(|row| {
                header
                    .iter()
                    .map(|key| match row.get(key.as_str()) {
                        None | Some(serde_json::Value::Null) => String::new(),
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                    })
                    .collect()
            })
            .collect();
        let widths: Vec<usize> = header
            .iter()
            .enumerate()
            .map(|(i, h)| {
                cells
                    .iter()
                    .map(|r| r[i].chars().count())
                    .chain(std::iter::once(h.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |values: Vec<&str>| {
            values
                .iter()
                .zip(&widths)
                .map(|(v, w)| format!("{:<width$}", v, width = *w))
                .collect::<Vec<_>>()
                .join(" | ")
        };
        println!("{}", line(header.iter().map(|h| h.as_str()).collect()));
        println!(
            "{}",
            widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-")
        );
        for row in &cells {
            println!("{}", line(row.iter().map(String::as_str).collect()));
        }
        if rows.len() > PREVIEW_ROWS {
            println!("... {} more row(s)", rows.len() - PREVIEW_ROWS);
        }
    }

    async fn prompt(input: &mut InputLines, label: &str) -> Result<String> {
        read_line(input, label)
            .await?
            .context("stdin closed before input was given")
    }

    async fn read_line(input: &mut InputLines, label: &str) -> Result<Option<String>> {
        eprint!("{}", label);
        std::io::stderr().flush().ok();
        Ok(input.next_line().await?)
    }
}

#[cfg(feature = "cli")]
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
