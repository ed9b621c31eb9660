/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use std::path::PathBuf;

fn usage() -> ! {
    eprintln!("usage: gander [-datadir dir] command");
    eprintln!("commands:");
    eprintln!("  init username listenaddr servername");
    eprintln!("  setconfig key value");
    eprintln!("  unplug hostname");
    eprintln!("  run");
    eprintln!("  version");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("static directive")),
        )
        .init();

    let mut data_dir = PathBuf::from(".");
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    while let Some(first) = args.first() {
        match first.as_str() {
            "-datadir" | "--datadir" => {
                args.remove(0);
                if args.is_empty() {
                    usage();
                }
                data_dir = PathBuf::from(args.remove(0));
            }
            _ => break,
        }
    }

    let cmd = if args.is_empty() {
        "run".to_string()
    } else {
        args.remove(0)
    };
    match cmd.as_str() {
        "version" => {
            println!("{}", gander_core::SOFTWARE_VERSION);
        }
        "init" => {
            if args.len() != 3 {
                usage();
            }
            gander_core::runtime::initialize(&data_dir, &args[0], &args[1], &args[2])?;
            println!("done.");
        }
        "setconfig" => {
            if args.len() != 2 {
                usage();
            }
            let store = gander_core::store::Store::open(data_dir.join("gander.db"))?;
            store.set_config(&args[0], &args[1])?;
        }
        "unplug" => {
            if args.len() != 1 {
                usage();
            }
            let store = gander_core::store::Store::open(data_dir.join("gander.db"))?;
            store.purge_host_resubmissions(&args[0])?;
            store.purge_host_followers(&args[0])?;
        }
        "run" => {
            let engine = gander_core::runtime::Engine::open(&data_dir)?;
            gander_core::runtime::serve(engine).await?;
        }
        _ => usage(),
    }
    Ok(())
}
