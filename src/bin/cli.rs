use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;

use lockdb::common::{RowKey, TxnId, Value};
use lockdb::scenario::Scenario;
use lockdb::transaction::concurrency::{
    DeadlockDetection, LockMode, ReadMode, TransactionHandle, TransactionManager,
    TransactionManagerConfig, WaitPolicy,
};

const HISTORY_FILE: &str = ".lockdb_history";

/// Lock wait used by the shell when none is configured, so a conflicting
/// command cannot hang the only thread
const SHELL_LOCK_TIMEOUT_MS: u64 = 1000;

#[derive(Parser)]
#[command(author, version, about = "LockDB CLI - explore locking, deadlocks and lost updates")]
struct Cli {
    /// JSON file with a transaction manager configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fail lock waits after this many milliseconds
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    /// Sweep for deadlocks on this period instead of checking on every wait
    #[arg(long)]
    periodic_detection_ms: Option<u64>,

    /// Command to execute
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive shell
    Shell,

    /// Run a canned concurrency scenario ("all" runs every one)
    Scenario {
        /// Scenario name
        name: String,
    },

    /// Show configuration and available scenarios
    Info,
}

fn load_config(cli: &Cli) -> Result<TransactionManagerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => TransactionManagerConfig::default(),
    };

    if let Some(timeout) = cli.lock_timeout_ms {
        config.lock_table.lock_timeout_ms = Some(timeout);
    }
    if let Some(interval_ms) = cli.periodic_detection_ms {
        config.lock_table.deadlock_detection = DeadlockDetection::Periodic { interval_ms };
    }
    Ok(config)
}

/// One line of shell input
#[derive(Debug, Clone, PartialEq)]
enum ShellCommand {
    Begin,
    Use(TxnId),
    Read(RowKey, ReadMode),
    Write(RowKey, Value),
    Delete(RowKey),
    CompareAndSwap { key: RowKey, expected: Value, new: Value },
    Lock { table: String, mode: LockMode, nowait: bool },
    Advisory { name: String, timeout: Option<Duration> },
    Commit,
    Rollback,
    Show,
    Locks,
    Help,
    Exit,
}

fn parse_key(word: &str) -> Result<RowKey> {
    match word.split_once('/') {
        Some((table, key)) if !table.is_empty() && !key.is_empty() => Ok(RowKey::new(table, key)),
        _ => bail!("Expected <table>/<key>, got '{}'", word),
    }
}

fn parse_value(text: &str) -> Result<Value> {
    text.parse::<Value>().map_err(|e| anyhow!(e))
}

fn parse_read_mode(word: Option<&str>) -> Result<ReadMode> {
    let Some(word) = word else {
        return Ok(ReadMode::Snapshot);
    };
    match word.to_lowercase().replace('_', "-").as_str() {
        "snapshot" => Ok(ReadMode::Snapshot),
        "for-key-share" => Ok(ReadMode::ForKeyShare),
        "for-share" => Ok(ReadMode::ForShare),
        "for-no-key-update" => Ok(ReadMode::ForNoKeyUpdate),
        "for-update" => Ok(ReadMode::ForUpdate),
        other => bail!("Unknown read mode '{}'", other),
    }
}

fn parse_command(line: &str) -> Result<ShellCommand> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        bail!("Empty command");
    };

    let command = match verb.to_lowercase().as_str() {
        "begin" => ShellCommand::Begin,
        "use" => {
            let id = words.next().ok_or_else(|| anyhow!("Usage: use <txn-id>"))?;
            ShellCommand::Use(id.parse().with_context(|| format!("Invalid transaction id '{}'", id))?)
        }
        "read" => {
            let key = parse_key(words.next().ok_or_else(|| anyhow!("Usage: read <table>/<key> [mode]"))?)?;
            ShellCommand::Read(key, parse_read_mode(words.next())?)
        }
        "write" => {
            let key = parse_key(words.next().ok_or_else(|| anyhow!("Usage: write <table>/<key> <value>"))?)?;
            let rest: Vec<&str> = words.by_ref().collect();
            if rest.is_empty() {
                bail!("Usage: write <table>/<key> <value>");
            }
            ShellCommand::Write(key, parse_value(&rest.join(" "))?)
        }
        "delete" => {
            let key = parse_key(words.next().ok_or_else(|| anyhow!("Usage: delete <table>/<key>"))?)?;
            ShellCommand::Delete(key)
        }
        "cas" => {
            let usage = "Usage: cas <table>/<key> <expected> <new>";
            let key = parse_key(words.next().ok_or_else(|| anyhow!(usage))?)?;
            let expected = parse_value(words.next().ok_or_else(|| anyhow!(usage))?)?;
            let new = parse_value(words.next().ok_or_else(|| anyhow!(usage))?)?;
            ShellCommand::CompareAndSwap { key, expected, new }
        }
        "lock" => {
            let table = words
                .next()
                .ok_or_else(|| anyhow!("Usage: lock <table> <mode> [nowait]"))?
                .to_string();
            let mut mode_words: Vec<&str> = words.by_ref().collect();
            let nowait = mode_words.last().is_some_and(|w| w.eq_ignore_ascii_case("nowait"));
            if nowait {
                mode_words.pop();
            }
            let mode = mode_words.join(" ").parse::<LockMode>()?;
            ShellCommand::Lock { table, mode, nowait }
        }
        "advisory" => {
            let name = words
                .next()
                .ok_or_else(|| anyhow!("Usage: advisory <name> [timeout-ms]"))?
                .to_string();
            let timeout = match words.next() {
                Some(ms) => Some(Duration::from_millis(
                    ms.parse().with_context(|| format!("Invalid timeout '{}'", ms))?,
                )),
                None => None,
            };
            ShellCommand::Advisory { name, timeout }
        }
        "commit" => ShellCommand::Commit,
        "rollback" | "abort" => ShellCommand::Rollback,
        "show" => ShellCommand::Show,
        "locks" => ShellCommand::Locks,
        "help" => ShellCommand::Help,
        "exit" | "quit" => ShellCommand::Exit,
        other => bail!("Unknown command '{}'. Type 'help' for assistance.", other),
    };

    Ok(command)
}

/// Shell state: one transaction manager and the transactions opened in it
struct Session {
    tm: TransactionManager,
    transactions: BTreeMap<TxnId, TransactionHandle>,
    current: Option<TxnId>,
    /// Advisory wait used when a command gives no timeout of its own
    advisory_timeout: Option<Duration>,
}

impl Session {
    fn new(config: TransactionManagerConfig) -> Result<Self> {
        let advisory_timeout = config.lock_table.lock_timeout();
        let tm = TransactionManager::new(config).context("Failed to start transaction manager")?;
        Ok(Self {
            tm,
            advisory_timeout,
            transactions: BTreeMap::new(),
            current: None,
        })
    }

    fn current(&self) -> Result<TransactionHandle> {
        let id = self
            .current
            .ok_or_else(|| anyhow!("No current transaction; run 'begin' first"))?;
        self.transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("Transaction {} is gone", id))
    }

    /// Forget transactions that have ended
    fn prune(&mut self) {
        self.transactions.retain(|_, txn| !txn.state().is_terminal());
        if self.current.is_some_and(|id| !self.transactions.contains_key(&id)) {
            self.current = None;
        }
    }

    fn execute(&mut self, command: ShellCommand) -> Result<String> {
        let output = match command {
            ShellCommand::Begin => {
                let txn = self.tm.begin();
                let id = txn.id();
                self.transactions.insert(id, txn);
                self.current = Some(id);
                format!("BEGIN (txn {})", id)
            }
            ShellCommand::Use(id) => {
                if !self.transactions.contains_key(&id) {
                    bail!("No open transaction {}", id);
                }
                self.current = Some(id);
                format!("Using txn {}", id)
            }
            ShellCommand::Read(key, mode) => {
                let txn = self.current()?;
                let result = self.tm.read(&txn, &key, mode);
                self.prune();
                match result? {
                    Some(value) => format!("{} = {}", key, value),
                    None => format!("{} = NULL", key),
                }
            }
            ShellCommand::Write(key, value) => {
                let txn = self.current()?;
                let result = self.tm.write(&txn, key.clone(), value);
                self.prune();
                result?;
                format!("WRITE {}", key)
            }
            ShellCommand::Delete(key) => {
                let txn = self.current()?;
                let result = self.tm.delete(&txn, key.clone());
                self.prune();
                result?;
                format!("DELETE {}", key)
            }
            ShellCommand::CompareAndSwap { key, expected, new } => {
                let txn = self.current()?;
                let result = self.tm.compare_and_swap(
                    &txn,
                    key.clone(),
                    |current| match current {
                        Some(value) => *value == expected,
                        None => expected.is_null(),
                    },
                    new,
                );
                self.prune();
                if result? {
                    format!("UPDATE 1 ({})", key)
                } else {
                    format!("UPDATE 0 ({} did not match)", key)
                }
            }
            ShellCommand::Lock { table, mode, nowait } => {
                let txn = self.current()?;
                let policy = if nowait { WaitPolicy::NoWait } else { WaitPolicy::Block };
                let result = self.tm.lock_table_with(&txn, &table, mode, policy);
                self.prune();
                result?;
                format!("LOCK TABLE {} IN {} MODE", table, mode)
            }
            ShellCommand::Advisory { name, timeout } => {
                let txn = self.current()?;
                let timeout = timeout.or(self.advisory_timeout);
                self.tm.advisory_xact_lock(&txn, &name, timeout)?;
                format!("Advisory lock '{}' held until txn {} ends", name, txn.id())
            }
            ShellCommand::Commit => {
                let txn = self.current()?;
                let result = self.tm.commit(&txn);
                self.prune();
                result?;
                format!("COMMIT (txn {})", txn.id())
            }
            ShellCommand::Rollback => {
                let txn = self.current()?;
                let result = self.tm.rollback(&txn);
                self.prune();
                result?;
                format!("ROLLBACK (txn {})", txn.id())
            }
            ShellCommand::Show => format_snapshot(&self.tm.snapshot()),
            ShellCommand::Locks => self.format_locks(),
            ShellCommand::Help => help_text(),
            ShellCommand::Exit => String::new(),
        };
        Ok(output)
    }

    fn format_locks(&self) -> String {
        let mut out = String::new();
        for id in self.tm.active_transaction_ids() {
            let marker = if self.current == Some(id) { "*" } else { " " };
            out.push_str(&format!("{} txn {}\n", marker, id));
            for (resource, mode) in self.tm.lock_manager().locks_held(id) {
                out.push_str(&format!("    {} {}\n", mode, resource));
            }
        }
        let edges = self.tm.lock_manager().wait_for_edges();
        if !edges.is_empty() {
            out.push_str("waits-for:\n");
            for (waiter, blocker) in edges {
                out.push_str(&format!("    {} -> {}\n", waiter, blocker));
            }
        }
        if out.is_empty() {
            out.push_str("(no active transactions)");
        }
        out.trim_end().to_string()
    }
}

fn format_snapshot(snapshot: &BTreeMap<RowKey, Value>) -> String {
    if snapshot.is_empty() {
        return "(0 rows)".to_string();
    }

    let width = snapshot.keys().map(|k| k.to_string().len()).max().unwrap_or(3).max(3);
    let mut out = String::new();
    out.push_str(&format!("| {:<width$} | value\n", "key", width = width));
    out.push_str(&format!("+{:-<w$}+-------\n", "", w = width + 2));
    for (key, value) in snapshot {
        out.push_str(&format!("| {:<width$} | {}\n", key.to_string(), value, width = width));
    }
    out.push_str(&format!("({} rows)", snapshot.len()));
    out
}

fn help_text() -> String {
    [
        "Available commands:",
        "  begin                              - Start a transaction and make it current",
        "  use <txn-id>                       - Switch the current transaction",
        "  read <table>/<key> [mode]          - Read a value (snapshot, for-share, for-update, ...)",
        "  write <table>/<key> <value>        - Stage a value",
        "  delete <table>/<key>               - Stage a delete",
        "  cas <table>/<key> <expected> <new> - Write only if the current value matches",
        "  lock <table> <mode> [nowait]       - LOCK TABLE in the given mode",
        "  advisory <name> [timeout-ms]       - Take a transaction-scoped advisory lock",
        "  commit | rollback                  - End the current transaction",
        "  show                               - List committed values",
        "  locks                              - List held locks and wait-for edges",
        "  help                               - Display this help message",
        "  exit                               - Exit the CLI",
    ]
    .join("\n")
}

fn run_shell(mut config: TransactionManagerConfig) -> Result<()> {
    if config.lock_table.lock_timeout_ms.is_none() {
        config.lock_table.lock_timeout_ms = Some(SHELL_LOCK_TIMEOUT_MS);
    }
    let mut session = Session::new(config)?;

    println!("Welcome to LockDB CLI. Type 'help' for assistance or 'exit' to quit.");

    let mut rl = Editor::<(), DefaultHistory>::new()?;
    if let Err(err) = rl.load_history(HISTORY_FILE) {
        if !err.to_string().contains("No such file or directory") {
            println!("Error loading history: {}", err);
        }
    }

    loop {
        let prompt = match session.current {
            Some(id) => format!("lockdb[{}]> ", id),
            None => "lockdb> ".to_string(),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);

                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let command = match parse_command(line) {
                    Ok(command) => command,
                    Err(err) => {
                        println!("Error: {}", err);
                        continue;
                    }
                };
                if command == ShellCommand::Exit {
                    println!("Goodbye!");
                    break;
                }
                match session.execute(command) {
                    Ok(output) => println!("{}", output),
                    Err(err) => println!("Error: {}", err),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {}", err);
                break;
            }
        }
    }

    if let Err(err) = rl.save_history(HISTORY_FILE) {
        println!("Error saving history: {}", err);
    }
    Ok(())
}

fn run_scenarios(name: &str, config: &TransactionManagerConfig) -> Result<()> {
    let scenarios: Vec<Scenario> = if name.eq_ignore_ascii_case("all") {
        Scenario::ALL.to_vec()
    } else {
        vec![name.parse::<Scenario>()?]
    };

    for scenario in scenarios {
        let report = scenario
            .run(config)
            .with_context(|| format!("Scenario {} failed", scenario))?;
        println!("{}", report);
    }
    Ok(())
}

fn print_info(config: &TransactionManagerConfig) {
    println!("LockDB Information:");
    match config.lock_table.lock_timeout_ms {
        Some(ms) => println!("  Lock timeout: {} ms", ms),
        None => println!("  Lock timeout: none"),
    }
    match config.lock_table.deadlock_detection {
        DeadlockDetection::Immediate => println!("  Deadlock detection: immediate"),
        DeadlockDetection::Periodic { interval_ms } => {
            println!("  Deadlock detection: every {} ms", interval_ms)
        }
    }
    println!("  Lock modes:");
    for mode in LockMode::ALL {
        println!("    {}", mode);
    }
    println!("  Scenarios:");
    for scenario in Scenario::ALL {
        println!("    {:<15} {}", scenario.name(), scenario.description());
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Some(Commands::Shell) | None => run_shell(config)?,
        Some(Commands::Scenario { name }) => run_scenarios(name, &config)?,
        Some(Commands::Info) => print_info(&config),
    }

    Ok(())
}
