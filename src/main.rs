//! RedHive CLI entry point

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::{ColoredString, Colorize};
use eyre::{Context, Result, eyre};
use tracing::info;

use redhive::cli::{Cli, Command};
use redhive::config::Config;
use redhive::container::ContainerRunner;
use redhive::llm::LlmGateway;
use redhive::manager::{TaskManager, TaskStatusView};
use redhive::{TaskSpec, TaskStatus, limits, metrics};

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

fn build_runner(config: &Config) -> Arc<ContainerRunner> {
    Arc::new(ContainerRunner::new(
        config.container.name.clone(),
        config.container.install_command.clone(),
        config.storage.log_dir.clone(),
    ))
}

/// Wire up the gateway, runner, manager, and reconciler
fn build_manager(config: Config) -> Result<Arc<TaskManager>> {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(limits().max_llm_concurrent.max(1) as usize));
    let gateway =
        Arc::new(LlmGateway::from_config(&config.llm, semaphore).map_err(|e| eyre!("LLM gateway setup failed: {e}"))?);
    let runner = build_runner(&config);

    let reconcile_interval = Duration::from_secs(config.parallel.reconcile_interval_secs);
    let manager = TaskManager::new(config, gateway, runner);
    manager.spawn_reconciler(reconcile_interval);
    Ok(manager)
}

fn status_colored(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Completed => status.as_str().green(),
        TaskStatus::Cancelled => status.as_str().yellow(),
        TaskStatus::Failed | TaskStatus::Impossible => status.as_str().red(),
        _ => status.as_str().normal(),
    }
}

async fn wait_for_terminal(manager: &Arc<TaskManager>, task_id: &str) -> Result<TaskStatusView> {
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let Some(view) = manager.get_task_status(task_id) else {
            return Err(eyre!("task {task_id} disappeared"));
        };
        if view.status.is_terminal() {
            return Ok(view);
        }
    }
}

fn print_task_view(view: &TaskStatusView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(view)?);
        return Ok(());
    }

    println!(
        "\n{} {} {} [{}]",
        view.status.icon(),
        status_colored(view.status),
        view.r#abstract,
        view.task_id
    );
    if let Some(result) = &view.result {
        println!("\n{}\n{result}", "Result:".bold());
    }
    if let Some(error) = &view.error {
        println!("\n{}\n{error}", "Error:".bold());
    }
    if let Some(graph) = &view.graph {
        println!("\n{}\n{graph}", "Task graph:".bold());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.parallel = config.parallel.clone().with_env_overrides();

    match cli.command {
        Command::Submit {
            r#abstract,
            description,
            verification,
            json,
        } => {
            let manager = build_manager(config)?;

            let spec = TaskSpec::new(r#abstract, description, verification);
            let task_id = manager.create_task(spec);
            info!(task_id, "task submitted");
            println!("Task {} submitted", task_id.as_str().bold());

            let view = wait_for_terminal(&manager, &task_id).await?;
            print_task_view(&view, json)?;
        }

        Command::Status { task_id, json } => {
            let manager = build_manager(config)?;
            match manager.get_task_status(&task_id) {
                Some(view) => print_task_view(&view, json)?,
                None => {
                    println!("{} task {task_id} not found", "error:".red().bold());
                    std::process::exit(1);
                }
            }
        }

        Command::List { json } => {
            let entries = build_manager(config)?.list_all_tasks();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No tasks");
            } else {
                for entry in entries {
                    let id = entry.node_id.as_deref().unwrap_or(&entry.task_id);
                    let indent = if entry.kind == "node" { "  " } else { "" };
                    println!(
                        "{indent}{} {} {} {}",
                        entry.status.icon(),
                        status_colored(entry.status),
                        id.bold(),
                        entry.r#abstract
                    );
                }
            }
        }

        Command::Nodes { task_id, json } => {
            let entries = build_manager(config)?.get_task_nodes(&task_id);
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("{} no nodes for task {task_id}", "error:".red().bold());
                std::process::exit(1);
            } else {
                for entry in entries {
                    let indent = "  ".repeat(entry.depth as usize);
                    println!(
                        "{indent}{} {} {} {}",
                        entry.status.icon(),
                        status_colored(entry.status),
                        entry.node_id.as_str().bold(),
                        entry.r#abstract
                    );
                }
            }
        }

        Command::Cancel { task_id } => {
            if build_manager(config)?.cancel_task(&task_id) {
                println!("Task {} cancelled", task_id.as_str().bold());
            } else {
                println!("no-op: task {task_id} is unknown or already terminal");
            }
        }

        Command::Restart { task_id, comments, json } => {
            let manager = build_manager(config)?;
            let Some(new_task_id) = manager.restart_task(&task_id, comments.as_deref()) else {
                println!("{} task {task_id} not found", "error:".red().bold());
                std::process::exit(1);
            };
            println!("Task {} restarted as {}", task_id.as_str().bold(), new_task_id.as_str().bold());

            let view = wait_for_terminal(&manager, &new_task_id).await?;
            print_task_view(&view, json)?;
        }

        Command::Probe => {
            let runner = build_runner(&config);
            match runner.probe().await {
                Ok(info) => println!("{} {info}", "ok:".green().bold()),
                Err(e) => {
                    println!("{} {e}", "error:".red().bold());
                    std::process::exit(1);
                }
            }
        }

        Command::Limits => {
            println!("{}", serde_json::to_string_pretty(&limits())?);
        }

        Command::Metrics => {
            println!("{}", serde_json::to_string_pretty(&metrics().snapshot())?);
        }
    }

    Ok(())
}
