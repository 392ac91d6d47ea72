// Copyright (c) 2022 Lev Kokotov <hi@levthe.dev>
// Copyright (c) 2023 Dmitriy Vasiliev <dmitrivasilyev@ozon.ru>

// Permission is hereby granted, free of charge, to any person obtaining
// a copy of this software and associated documentation files (the
// "Software"), to deal in the Software without restriction, including
// without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to
// permit persons to whom the Software is furnished to do so, subject to
// the following conditions:

// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE
// LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION
// OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION
// WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

use log::{error, info, warn};
use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use tokio::runtime::Builder;

extern crate exitcode;

use pg_frontend::config::{Config, VERSION};
use pg_frontend::connect;
use pg_frontend::executor::{QueryExecutor, RowCollector};
use pg_frontend::{cmd_args, logger};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = cmd_args::parse();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // Create a transient runtime for loading the config for the first time.
    let config: Config = {
        let runtime = Builder::new_multi_thread().worker_threads(1).build()?;

        runtime.block_on(async {
            match pg_frontend::config::parse(args.config_file.as_str()).await {
                Ok(config) => config,
                Err(err) => {
                    let stdin = io::stdin();
                    if stdin.is_terminal() {
                        eprintln!("Config parse error: {err}");
                        let _ = io::stdout().flush();
                    } else {
                        error!("Config parse error: {err:?}");
                    }
                    std::process::exit(exitcode::CONFIG);
                }
            }
        })
    };

    logger::init(&args);

    info!("Welcome to pg_frontend! (Version {VERSION})");
    config.show();

    let runtime = Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("worker-pg-frontend")
        .build()?;

    let code = runtime.block_on(async move {
        let mut executor = match connect::open(&config).await {
            Ok(executor) => executor,
            Err(err) => {
                error!("Could not connect to {}: {err}", config.connection.host_spec());
                return exitcode::UNAVAILABLE;
            }
        };

        info!(
            "Connected to {} as {}@{}, backend pid {}, server version {} ({}), ssl: {}",
            executor.host_spec(),
            executor.user(),
            executor.database(),
            executor.backend_pid(),
            executor.server_version(),
            executor.server_version_num(),
            executor.base().is_tls()
        );
        for (name, value) in executor.parameter_statuses() {
            info!("  {name} = {value}");
        }

        let mut code = exitcode::OK;

        if let Some(query) = &args.query {
            // Ctrl-C cancels the running statement, the connection stays usable.
            let token = executor.cancel_token();
            let canceller = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Got SIGINT, cancelling the running query");
                    token.send_cancel().await;
                }
            });

            let mut collector = RowCollector::default();
            let result = executor.execute_simple(query, &mut collector).await;
            canceller.abort();

            let encoding = executor.encoding().clone();
            let header: Vec<&str> = collector.fields.iter().map(|f| f.name.as_str()).collect();
            if !header.is_empty() {
                println!("{}", header.join("\t"));
            }
            for row in &collector.rows {
                let columns: Vec<String> = row
                    .iter()
                    .map(|column| match column {
                        Some(bytes) => encoding.decode(bytes),
                        None => "NULL".to_string(),
                    })
                    .collect();
                println!("{}", columns.join("\t"));
            }
            for status in &collector.statuses {
                info!("{status}");
            }

            if let Err(err) = result {
                error!("Query failed: {err}");
                if executor.will_heal_on_retry(&err) {
                    info!("The statement would succeed if re-prepared");
                }
                code = exitcode::DATAERR;
            }
        }

        if args.listen_wait > 0 && !executor.is_closed() {
            info!("Waiting {}s for notifications", args.listen_wait);
            if let Err(err) = executor
                .process_notifies(Some(Duration::from_secs(args.listen_wait)))
                .await
            {
                error!("Notification processing failed: {err}");
                code = exitcode::IOERR;
            }
            for notification in executor.take_notifications() {
                println!(
                    "NOTIFY {} from pid {}: {}",
                    notification.name, notification.pid, notification.parameter
                );
            }
        }

        for warning in executor.take_warnings() {
            warn!("{warning}");
        }

        executor.close().await;
        code
    });

    info!("Shutting down...");
    std::process::exit(code);
}
