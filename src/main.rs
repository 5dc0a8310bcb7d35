use std::net::TcpListener;
use std::sync::Arc;

use loamdb::catalog::Catalog;
use loamdb::server::serve;
use loamdb::tcop::postgres::{BackendMessage, FrontendMessage, PostgresSession};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = match CliOptions::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{}", message);
            print_usage();
            std::process::exit(2);
        }
    };
    if options.help {
        print_usage();
        return;
    }

    let catalog = Arc::new(Catalog::new());
    let mut session = PostgresSession::new(Arc::clone(&catalog));

    // Files first, then -c commands, matching the documented order.
    for path in &options.files {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                eprintln!("Error reading file {}: {}", path, err);
                std::process::exit(1);
            }
        };
        execute_script(&mut session, &content);
    }
    for command in &options.commands {
        execute_script(&mut session, command);
    }

    if options.quit {
        return;
    }

    let address = format!("0.0.0.0:{}", options.port);
    let listener = match TcpListener::bind(&address) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("Failed to bind {}: {}", address, err);
            std::process::exit(1);
        }
    };
    println!("loamdb server starting on port {}", options.port);
    if let Err(err) = serve(listener, catalog) {
        eprintln!("Server error: {}", err);
        std::process::exit(1);
    }
}

struct CliOptions {
    port: u16,
    commands: Vec<String>,
    files: Vec<String>,
    quit: bool,
    help: bool,
}

impl CliOptions {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut options = Self {
            port: 5432,
            commands: Vec::new(),
            files: Vec::new(),
            quit: false,
            help: false,
        };
        let mut args = args.peekable();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-port" | "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| "missing value for -port".to_string())?;
                    options.port = value
                        .parse()
                        .map_err(|_| format!("invalid port: {}", value))?;
                }
                "-c" => {
                    let value = args
                        .next()
                        .ok_or_else(|| "missing value for -c".to_string())?;
                    options.commands.push(value);
                }
                "-f" => {
                    let value = args
                        .next()
                        .ok_or_else(|| "missing value for -f".to_string())?;
                    options.files.push(value);
                }
                "-q" => options.quit = true,
                "-h" | "-help" | "--help" => options.help = true,
                other => return Err(format!("unknown option: {}", other)),
            }
        }
        Ok(options)
    }
}

fn print_usage() {
    eprintln!("loamdb - a PostgreSQL-compatible, schema-less, in-memory database");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  loamdb [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -port PORT    Port to listen on (default: 5432)");
    eprintln!("  -c COMMAND    Execute command (can be specified multiple times)");
    eprintln!("  -f FILE       Execute SQL from file (can be specified multiple times)");
    eprintln!("  -q            Quit after executing commands (don't start server)");
    eprintln!("  -h, -help     Show this help message");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  loamdb");
    eprintln!("  loamdb -port 5433");
    eprintln!("  loamdb -c \"SELECT * FROM users;\" -q");
    eprintln!("  loamdb -f seed.sql");
    eprintln!("  loamdb -f schema.sql -f data.sql -q");
}

fn execute_script(session: &mut PostgresSession, script: &str) {
    for statement in split_sql_statements(script) {
        let statement = statement.trim();
        if statement.is_empty() || is_comment_only(statement) {
            continue;
        }
        match run_statement(session, statement) {
            Ok(result) => print_query_result(&result),
            Err(message) => {
                eprintln!("ERROR: {}", message);
                std::process::exit(1);
            }
        }
    }
}

struct CliQueryResult {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    command_tag: String,
}

fn run_statement(session: &mut PostgresSession, sql: &str) -> Result<CliQueryResult, String> {
    let messages = session.run_sync([FrontendMessage::Query {
        sql: sql.to_string(),
    }]);

    let mut columns = Vec::new();
    let mut rows = Vec::new();
    let mut command_tag = String::new();
    for message in messages {
        match message {
            BackendMessage::RowDescription { fields } => {
                columns = fields.into_iter().map(|field| field.name).collect();
            }
            BackendMessage::DataRow { values } => rows.push(values),
            BackendMessage::CommandComplete { tag } => command_tag = tag,
            BackendMessage::ErrorResponse { message, .. } => return Err(message),
            _ => {}
        }
    }
    Ok(CliQueryResult {
        columns,
        rows,
        command_tag,
    })
}

fn print_query_result(result: &CliQueryResult) {
    if result.columns.is_empty() || result.rows.is_empty() {
        println!("{}", result.command_tag);
        return;
    }

    println!("{}", result.columns.join("\t"));
    let separators: Vec<&str> = result.columns.iter().map(|_| "----").collect();
    println!("{}", separators.join("\t"));
    for row in &result.rows {
        let values: Vec<&str> = row
            .iter()
            .map(|value| value.as_deref().unwrap_or(""))
            .collect();
        println!("{}", values.join("\t"));
    }
    println!("({} rows)", result.rows.len());
    println!();
}

fn is_comment_only(statement: &str) -> bool {
    let mut rest = statement.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            match after.find('\n') {
                Some(idx) => rest = after[idx + 1..].trim_start(),
                None => return true,
            }
        } else if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(idx) => rest = after[idx + 2..].trim_start(),
                None => return true,
            }
        } else {
            return rest.is_empty();
        }
    }
}

/// Splits a script on semicolons while respecting single/double quotes and
/// `--` / `/* */` comments, so quoted semicolons never split a statement.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    let chars: Vec<char> = sql.chars().collect();
    let mut idx = 0usize;
    while idx < chars.len() {
        let ch = chars[idx];
        let next = chars.get(idx + 1).copied();

        if in_line_comment {
            current.push(ch);
            if ch == '\n' {
                in_line_comment = false;
            }
            idx += 1;
            continue;
        }
        if in_block_comment {
            current.push(ch);
            if ch == '*' && next == Some('/') {
                current.push('/');
                idx += 2;
                in_block_comment = false;
                continue;
            }
            idx += 1;
            continue;
        }
        if in_single {
            current.push(ch);
            if ch == '\'' {
                if next == Some('\'') {
                    current.push('\'');
                    idx += 2;
                    continue;
                }
                in_single = false;
            }
            idx += 1;
            continue;
        }
        if in_double {
            current.push(ch);
            if ch == '"' {
                if next == Some('"') {
                    current.push('"');
                    idx += 2;
                    continue;
                }
                in_double = false;
            }
            idx += 1;
            continue;
        }

        match ch {
            '-' if next == Some('-') => {
                in_line_comment = true;
                current.push(ch);
            }
            '/' if next == Some('*') => {
                in_block_comment = true;
                current.push(ch);
            }
            '\'' => {
                in_single = true;
                current.push(ch);
            }
            '"' => {
                in_double = true;
                current.push(ch);
            }
            ';' => {
                if !current.trim().is_empty() {
                    statements.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
        idx += 1;
    }

    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_semicolons_outside_literals_and_comments() {
        let statements = split_sql_statements(
            "INSERT INTO t VALUES ('a;b'); -- trailing; comment\nSELECT 1; /* a;b */ SELECT 2",
        );
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "INSERT INTO t VALUES ('a;b')");
        assert!(statements[1].starts_with("-- trailing; comment"));
        assert!(statements[2].starts_with("/* a;b */"));
    }

    #[test]
    fn quoted_identifiers_protect_semicolons() {
        let statements = split_sql_statements("SELECT \"a;b\" FROM t; SELECT 2");
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn comment_only_segments_are_detected() {
        assert!(is_comment_only("-- nothing here"));
        assert!(is_comment_only("/* nothing */"));
        assert!(is_comment_only("/* a */ -- b"));
        assert!(!is_comment_only("/* a */ SELECT 1"));
    }

    #[test]
    fn cli_options_parse_flags() {
        let options = CliOptions::parse(
            ["-port", "5433", "-c", "SELECT 1", "-f", "seed.sql", "-q"]
                .into_iter()
                .map(String::from),
        )
        .expect("options should parse");
        assert_eq!(options.port, 5433);
        assert_eq!(options.commands, vec!["SELECT 1"]);
        assert_eq!(options.files, vec!["seed.sql"]);
        assert!(options.quit);
    }
}
