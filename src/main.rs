use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use rustyline::error::ReadlineError;
use rustyline::Editor;
use tracing_subscriber::EnvFilter;

use logica::{json, parser::FileParser, Universe};

/// Compiler from the Logica logic programming language to SQL.
#[derive(Parser)]
#[command(name = "logica", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a predicate of a program to SQL.
    Compile {
        /// The program file.
        file: PathBuf,
        /// The predicate to compile.
        predicate: String,
        #[command(flatten)]
        options: CompileOptions,
    },
    /// Compile a predicate and run it on SQLite.
    Run {
        file: PathBuf,
        predicate: String,
        /// SQLite database to run against; in-memory when omitted.
        #[arg(long)]
        db: Option<PathBuf>,
        #[command(flatten)]
        options: CompileOptions,
    },
    /// Print the parsed program as JSON.
    Parse {
        file: PathBuf,
        /// Emit the full parse unit rather than just the rules.
        #[arg(long)]
        full: bool,
        #[arg(long, value_name = "DIR:DIR:...")]
        import_root: Option<String>,
    },
}

#[derive(clap::Args)]
struct CompileOptions {
    /// Target engine, overriding the program's @Engine annotation.
    #[arg(long, value_parser = ["sqlite", "psql", "bigquery", "duckdb"])]
    engine: Option<String>,
    /// Colon-separated search path for import statements.
    #[arg(long, value_name = "DIR:DIR:...")]
    import_root: Option<String>,
    /// Flag values, as name=value. Repeatable.
    #[arg(long = "flag", value_name = "NAME=VALUE")]
    flags: Vec<String>,
}

fn import_roots(flag: Option<&str>) -> Vec<PathBuf> {
    let spec = flag
        .map(str::to_string)
        .or_else(|| std::env::var("LOGICAPATH").ok())
        .unwrap_or_else(|| ".".to_string());
    spec.split(':')
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn user_flags(flags: &[String]) -> Result<IndexMap<String, String>> {
    let mut result = IndexMap::new();
    for flag in flags {
        let (name, value) = flag
            .split_once('=')
            .ok_or_else(|| anyhow!("flag must be name=value, got: {flag}"))?;
        result.insert(name.to_string(), value.to_string());
    }
    Ok(result)
}

fn build_universe(file: &PathBuf, options: &CompileOptions) -> Result<Universe> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let unit = FileParser::new(import_roots(options.import_root.as_deref())).parse(&text)?;
    let universe = Universe::new(unit, user_flags(&options.flags)?, options.engine.as_deref())?;
    Ok(universe)
}

fn run_on_sqlite(sql: &str, db: Option<&PathBuf>) -> Result<()> {
    let connection = match db {
        Some(path) => rusqlite::Connection::open(path)?,
        None => rusqlite::Connection::open_in_memory()?,
    };
    let mut statement = connection.prepare(sql.trim_end_matches(['\n', ';']))?;
    let column_names: Vec<String> =
        statement.column_names().iter().map(|c| c.to_string()).collect();
    println!("{}", column_names.join("\t"));
    let column_count = column_names.len();
    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let mut rendered = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => "null".to_string(),
                rusqlite::types::ValueRef::Integer(x) => x.to_string(),
                rusqlite::types::ValueRef::Real(x) => x.to_string(),
                rusqlite::types::ValueRef::Text(s) => {
                    String::from_utf8_lossy(s).into_owned()
                }
                rusqlite::types::ValueRef::Blob(_) => "<blob>".to_string(),
            };
            rendered.push(value);
        }
        println!("{}", rendered.join("\t"));
    }
    Ok(())
}

/// Interactive shell: statements accumulate into a program, `?Predicate;`
/// compiles and prints its SQL.
fn shell() -> Result<()> {
    let mut editor = Editor::<()>::new();
    let mut program = String::new();
    let mut input = String::new();
    loop {
        let prompt = if input.is_empty() { "logica> " } else { "  ...> " };
        match editor.readline(prompt) {
            Ok(line) => {
                input.push_str(line.trim());
                input.push('\n');
                if !input.contains(';') {
                    continue;
                }
                let chunk = std::mem::take(&mut input);
                editor.add_history_entry(chunk.trim());
                let chunk = chunk.trim();
                if let Some(predicate) = chunk.strip_prefix('?') {
                    let predicate = predicate.trim_end_matches(';').trim();
                    let compiled = logica::parse_program(&program)
                        .and_then(|unit| Universe::new(unit, IndexMap::new(), None))
                        .and_then(|universe| universe.compile(predicate));
                    match compiled {
                        Ok(sql) => println!("{sql}"),
                        Err(e) => eprintln!("{e}"),
                    }
                } else {
                    // Validate before accepting the statement.
                    let mut candidate = program.clone();
                    candidate.push_str(chunk);
                    candidate.push('\n');
                    match logica::parse_program(&candidate) {
                        Ok(_) => program = candidate,
                        Err(e) => eprintln!("{e}"),
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let result = match cli.command {
        None => shell(),
        Some(Command::Compile { file, predicate, options }) => {
            build_universe(&file, &options).and_then(|universe| {
                let sql = universe.compile(&predicate)?;
                println!("{sql}");
                Ok(())
            })
        }
        Some(Command::Run { file, predicate, db, options }) => {
            build_universe(&file, &options).and_then(|universe| {
                if universe.dialect().name() != "SqLite" {
                    return Err(anyhow!(
                        "run executes on SQLite; recompile with --engine=sqlite or use the \
                         compiled SQL with your own driver"
                    ));
                }
                let sql = universe.compile(&predicate)?;
                run_on_sqlite(&sql, db.as_ref())
            })
        }
        Some(Command::Parse { file, full, import_root }) => (|| {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let unit = FileParser::new(import_roots(import_root.as_deref())).parse(&text)?;
            println!("{}", json::render(&unit, full));
            Ok(())
        })(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
