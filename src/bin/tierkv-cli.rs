//! Interactive driver for the engine.
//!
//! A line-oriented REPL over a single store:
//!
//! ```text
//! p K V    put
//! g K      get (prints the value, or a blank line on a miss)
//! r K1 K2  range scan over [K1, K2)
//! d K      delete
//! s        stats
//! q        quit
//! ```

use std::io::{self, BufRead, Write};

use tierkv::{Lsm, LsmConfig, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(dir) => LsmConfig::new(dir),
        None => LsmConfig::default(),
    };
    let mut lsm = Lsm::new(config)?;

    println!("tierkv interactive mode (p/g/r/d/s, q to quit)");
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        if !run_command(&mut lsm, line.trim()).await? {
            break;
        }
    }

    lsm.close().await
}

/// Execute one REPL line. Returns false when the session should end.
async fn run_command(lsm: &mut Lsm, line: &str) -> Result<bool> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let Some(&cmd) = fields.first() else {
        return Ok(true);
    };

    match (cmd, &fields[1..]) {
        ("p", [key, value]) => match (key.parse(), value.parse()) {
            (Ok(key), Ok(value)) => lsm.put(key, value).await?,
            _ => eprintln!("usage: p <key> <value>"),
        },
        ("g", [key]) => match key.parse() {
            Ok(key) => match lsm.get(key).await? {
                Some(value) => println!("{value}"),
                None => println!(),
            },
            _ => eprintln!("usage: g <key>"),
        },
        ("r", [k1, k2]) => match (k1.parse(), k2.parse()) {
            (Ok(k1), Ok(k2)) => {
                let pairs = lsm.range_scan(k1, k2).await?;
                for kv in &pairs {
                    print!("{}:{} ", kv.key, kv.value);
                }
                println!();
            }
            _ => eprintln!("usage: r <key1> <key2>"),
        },
        ("d", [key]) => match key.parse() {
            Ok(key) => lsm.delete(key).await?,
            _ => eprintln!("usage: d <key>"),
        },
        ("s", _) => {
            let stats = lsm.stats().await?;
            println!("elements in buffer (including deletes): {}", stats.buffer_elements);
            for (i, count) in stats.level_elements.iter().enumerate() {
                println!("elements in disk level {} (including deletes): {}", i + 1, count);
            }
        }
        ("q", _) => return Ok(false),
        _ => eprintln!("unknown command: {line}"),
    }
    Ok(true)
}
