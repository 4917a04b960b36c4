use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use fragdb::config::{
    Config, DEFAULT_DB, DEFAULT_EMBED_MODEL, DEFAULT_LLM_MODEL, DEFAULT_OPENAI_URL,
};
use fragdb::server::{self, AppState};
use fragdb::{AddOutcome, Knowledge, Limit, ModelRef, Proxy, Result, VecDist, DEFAULT_LABEL};
use tracing::debug;

#[derive(Parser)]
#[command(name = "fragdb")]
#[command(about = "A knowledge base of embedded text fragments that answers questions about them")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Path to the database file
    #[arg(long, env = "FRAGDB_DB", default_value = DEFAULT_DB, global = true)]
    pub db: PathBuf,

    #[arg(long, env = "FRAGDB_OPENAI_KEY", hide_env_values = true, global = true)]
    pub openai_key: Option<String>,

    /// Root of an OpenAI compatible API
    #[arg(long, env = "FRAGDB_OPENAI_URL", default_value = DEFAULT_OPENAI_URL, global = true)]
    pub openai_url: String,

    /// Embedding model as provider/model
    #[arg(long, env = "FRAGDB_EMBED_MODEL", default_value = DEFAULT_EMBED_MODEL, global = true)]
    pub embed_model: ModelRef,

    /// Generation model as provider/model
    #[arg(long, env = "FRAGDB_LLM_MODEL", default_value = DEFAULT_LLM_MODEL, global = true)]
    pub llm_model: ModelRef,

    #[arg(short, long, env = "FRAGDB_VERBOSE", global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    pub fn config(&self) -> Config {
        Config {
            db: self.db.clone(),
            openai_key: self.openai_key.clone(),
            openai_url: self.openai_url.clone(),
            embed_model: self.embed_model.clone(),
            llm_model: self.llm_model.clone(),
            verbose: self.verbose,
        }
    }
}

#[derive(Args)]
pub struct LimitArgs {
    /// Documents to return, either N or LABEL:N per label pattern,
    /// e.g. --limit QA:3 --limit policies:2
    #[arg(long = "limit", env = "FRAGDB_LIMIT", default_value = "5", value_delimiter = ',')]
    pub limits: Vec<Limit>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Add files to the knowledge base
    Add {
        /// Label for the added fragments
        #[arg(long, env = "FRAGDB_LABEL", default_value = DEFAULT_LABEL)]
        label: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Search the knowledge base for documents
    Search {
        #[command(flatten)]
        limits: LimitArgs,

        /// Print the content of every fragment found
        #[arg(long)]
        emit: bool,

        #[arg(required = true)]
        query: Vec<String>,
    },

    /// Ask a question about the knowledge base
    Prompt {
        #[command(flatten)]
        limits: LimitArgs,

        /// System prompt used when answering
        #[arg(long, default_value = "")]
        system_prompt: String,

        #[arg(required = true)]
        query: Vec<String>,
    },

    /// List stored fragments
    List,

    /// Show the number of stored fragments
    Count,

    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1:7878")]
        bind: String,
    },
}

/// Runs one parsed command line against the configured store.
pub fn run(cli: Cli, distance: VecDist) -> Result<()> {
    let config = cli.global.config();
    debug!(?config, "configuration");

    // serve opens the stores its requests name, not the configured one
    if let Command::Serve { bind } = &cli.command {
        return serve(bind, distance);
    }

    let store = config.open_store(distance)?;
    let proxy = Proxy::from_config(&config)?;
    let knowledge = Knowledge::new(store, proxy, config.embed_model, config.llm_model);

    let stdout = std::io::stdout();
    execute_command(knowledge, cli.command, &mut stdout.lock())
}

fn serve(bind: &str, distance: VecDist) -> Result<()> {
    server::serve(bind, AppState::new(distance))?;
    Ok(())
}

fn execute_command(knowledge: Knowledge, command: Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Add { label, files } => {
            for file in files {
                match knowledge.add_file(&file, &label)? {
                    AddOutcome::Stored(fragment) => {
                        writeln!(out, "Added '{}' as fragment {}", fragment.name, fragment.id)?
                    }
                    AddOutcome::Unchanged => writeln!(out, "Unchanged '{}'", file.display())?,
                }
            }
        }

        Command::Search { limits, emit, query } => {
            let fragments = knowledge.search(&query.join(" "), &limits.limits)?;
            for fragment in fragments {
                writeln!(out, "{}", fragment.name)?;
                if emit {
                    writeln!(out, "{}\n", fragment.content)?;
                }
            }
        }

        Command::Prompt { limits, system_prompt, query } => {
            let knowledge = knowledge.with_system_prompt(system_prompt);
            let answer = knowledge.ask(&query.join(" "), &limits.limits)?;
            writeln!(out, "{}", answer.answer)?;
        }

        Command::List => {
            let fragments = knowledge.store().list()?;
            if fragments.is_empty() {
                writeln!(out, "Database is empty")?;
            } else {
                writeln!(out, "Stored fragments:")?;
                for f in &fragments {
                    writeln!(
                        out,
                        "  {}: [{}] {} ({} dims, {})",
                        f.id,
                        f.label,
                        f.name,
                        f.embedding_vector.len(),
                        f.embedding_model
                    )?;
                }
                writeln!(out, "Total: {} fragments", fragments.len())?;
            }
        }

        Command::Count => writeln!(out, "{}", knowledge.store().count()?)?,

        Command::Serve { bind } => serve(&bind, knowledge.store().distance().clone())?,
    }

    Ok(())
}

#[cfg(test)]
mod cli_test {
    use super::*;
    use fragdb::{EmbedPurpose, Embedder, FragmentStore};
    use std::sync::Arc;

    struct LengthEmbedder;

    impl Embedder for LengthEmbedder {
        fn provider(&self) -> &str {
            "fake"
        }

        fn embed(&self, text: &str, _model: &ModelRef, _purpose: EmbedPurpose) -> Result<Vec<f64>> {
            Ok(vec![text.len() as f64, 1.0])
        }
    }

    fn knowledge() -> Knowledge {
        let mut proxy = Proxy::new();
        proxy.register_embedder(Arc::new(LengthEmbedder));
        Knowledge::new(
            FragmentStore::open_in_memory().unwrap(),
            proxy,
            ModelRef::new("fake", "embed"),
            ModelRef::new("fake", "chat"),
        )
    }

    fn output(knowledge: Knowledge, command: Command) -> String {
        let mut out = Vec::new();
        execute_command(knowledge, command, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    // ========== Parsing Tests ==========

    #[test]
    fn test_parse_search_limits() {
        let cli = Cli::try_parse_from([
            "fragdb", "--db", "kb.db", "search", "--limit", "QA:3", "--limit", "policies:2", "refund", "policy",
        ])
        .unwrap();

        assert_eq!(cli.global.db, PathBuf::from("kb.db"));
        let Command::Search { limits, emit, query } = cli.command else {
            panic!("expected search");
        };
        assert_eq!(limits.limits, vec![Limit::new("QA", 3), Limit::new("policies", 2)]);
        assert!(!emit);
        assert_eq!(query, vec!["refund", "policy"]);
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["fragdb", "prompt", "why?"]).unwrap();
        assert_eq!(cli.global.embed_model, ModelRef::new("openai", "text-embedding-3-small"));
        assert_eq!(cli.global.llm_model, ModelRef::new("openai", "gpt-4o-mini"));

        let Command::Prompt { limits, system_prompt, .. } = cli.command else {
            panic!("expected prompt");
        };
        assert_eq!(limits.limits, vec![Limit::new("%", 5)]);
        assert!(system_prompt.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(Cli::try_parse_from(["fragdb", "search", "--limit", "QA:x", "q"]).is_err());
        assert!(Cli::try_parse_from(["fragdb", "--embed-model", "small", "count"]).is_err());
        assert!(Cli::try_parse_from(["fragdb", "add"]).is_err());
    }

    // ========== Execution Tests ==========

    #[test]
    fn test_add_prints_each_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("note.txt");
        std::fs::write(&file, "hello").unwrap();

        let knowledge = knowledge();
        knowledge.add("QA", &file.to_string_lossy(), "hello").unwrap();

        let add = Command::Add { label: "QA".to_string(), files: vec![file.clone()] };
        let printed = output(knowledge, add);
        assert_eq!(printed, format!("Unchanged '{}'\n", file.display()));

        let add = Command::Add { label: "other".to_string(), files: vec![file.clone()] };
        let printed = output(self::knowledge(), add);
        assert_eq!(printed, format!("Added '{}' as fragment 1\n", file.display()));
    }

    #[test]
    fn test_list_empty_and_count() {
        assert_eq!(output(knowledge(), Command::List), "Database is empty\n");
        assert_eq!(output(knowledge(), Command::Count), "0\n");
    }

    #[test]
    fn test_search_prints_names() {
        let knowledge = knowledge();
        knowledge.add("QA", "short.txt", "hi").unwrap();

        let search = Command::Search {
            limits: LimitArgs { limits: vec![Limit::default()] },
            emit: true,
            query: vec!["hey".to_string()],
        };
        assert_eq!(output(knowledge, search), "short.txt\nhi\n\n");
    }

    // ========== Serve Tests ==========

    #[test]
    fn test_serve_does_not_open_configured_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("kb").join("fragments.db");
        let cli = Cli::try_parse_from([
            "fragdb",
            "--db",
            db.to_str().unwrap(),
            "serve",
            "--bind",
            "not an address",
        ])
        .unwrap();

        assert!(run(cli, VecDist::default()).is_err());
        assert!(!db.exists());
        assert!(!dir.path().join("kb").exists());
    }
}
