use std::sync::Arc;

use sheets_client::{ClientError, Config, Indicator, Notebook};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HELP: &str = "\
commands:
  add <file>                 create an empty file
  edit <file> <content>      replace file content (\\n for newlines)
  type <file> <content>      same as edit, debounced like keystrokes
  run <file> [--sub]         execute a file (--sub: report subexpressions)
  runall                     execute every file in name order
  delete <file> --yes        delete a file
  ls                         list files
  show <file>                print a file's state as JSON
  nav [filter]               list files matching filter
  status                     connection status
  quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheets_client=debug,shared_types=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(url = %config.server_url, "sheets client starting");

    let notebook = Notebook::new(&config);

    // Renders are coalesced: the hook only flags that the view is dirty.
    let dirty = Arc::new(Notify::new());
    let hook = dirty.clone();
    notebook.model().set_renderer(move || hook.notify_one());
    let view_model = notebook.model().clone();
    let view = tokio::spawn(async move {
        loop {
            dirty.notified().await;
            view_model.read(|model| {
                let executing = model.files().values().filter(|f| f.is_executing).count();
                let stale = model.files().values().filter(|f| f.output_is_stale()).count();
                debug!(
                    files = model.files().len(),
                    executing,
                    stale,
                    indicator = Indicator::from_model(model).label(),
                    "render"
                );
            });
        }
    });

    notebook.open();
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match handle_line(&notebook, line.trim()) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!(error = %e, "command failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    notebook.shutdown();
    notebook.model().clear_renderer();
    view.abort();
    Ok(())
}

/// Run one console command. Returns false when the user asked to quit.
fn handle_line(notebook: &Notebook, line: &str) -> anyhow::Result<bool> {
    let mut parts = line.splitn(3, ' ');
    let verb = parts.next().unwrap_or_default();
    let target = parts.next().map(str::trim).filter(|s| !s.is_empty());
    let rest = parts.next().unwrap_or_default();

    match (verb, target) {
        ("", _) => {}
        ("quit" | "exit", _) => return Ok(false),
        ("help", _) => println!("{HELP}"),
        ("add", Some(file)) => report(notebook.add_file(file))?,
        ("edit", Some(file)) => report(notebook.update_file(file, &rest.replace("\\n", "\n")))?,
        ("type", Some(file)) => notebook.type_into(file, &rest.replace("\\n", "\n")),
        ("run", Some(file)) => report(notebook.execute_file(file, rest.trim() == "--sub"))?,
        ("runall", _) => match notebook.run_all() {
            Ok(count) => println!("requested {count} executions"),
            Err(e) => report(Err(e))?,
        },
        ("delete", Some(file)) => {
            let confirmed = rest.trim() == "--yes";
            match notebook.delete_file(file, |_| confirmed) {
                Ok(true) => {}
                Ok(false) => println!("not deleted; repeat with --yes to confirm"),
                Err(e) => report(Err(e))?,
            }
        }
        ("ls", _) => {
            let model = notebook.model().snapshot();
            for (name, file) in model.files() {
                let state = if file.is_executing {
                    "running"
                } else if file.output_is_stale() {
                    "stale"
                } else if file.output.is_some() {
                    "done"
                } else {
                    "-"
                };
                println!("{name:<32} {state:<8} {} bytes", file.content.len());
            }
        }
        ("show", Some(file)) => match notebook.model().file(file) {
            Some(file) => println!("{}", serde_json::to_string_pretty(&file)?),
            None => println!("no such file: {file}"),
        },
        ("nav", filter) => {
            for name in notebook.navigation_candidates(filter.unwrap_or_default()) {
                println!("{name}");
            }
        }
        ("status", _) => {
            let indicator = notebook.model().read(Indicator::from_model);
            println!("{} ({})", notebook.transport().status(), indicator.label());
        }
        (verb, _) => println!("unknown or incomplete command: {verb} (try help)"),
    }
    Ok(true)
}

/// Offline sends are applied locally; only report them.
fn report(result: Result<(), ClientError>) -> anyhow::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(ClientError::NotConnected) => {
            println!("offline: change kept locally, not delivered");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
