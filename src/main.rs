use chrono::NaiveDateTime;
use clap::{CommandFactory, Parser};
use color_eyre::eyre::{Context, bail, eyre};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use mirrors::cli::{Cli, Command};
use mirrors::config::{self, Config};
use mirrors::paths::Paths;
use mirrors::protocol::{Request, Response};
use mirrors::state_files::format_datetime;
use mirrors::updater::{SiteStatus, UpdateState};
use owo_colors::OwoColorize;
use std::path::PathBuf;

#[tokio::main(flavor = "current_thread")]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Daemon { config } => {
            mirrors::daemon::init_tracing();
            let config = load(config)?;
            let paths = Paths::new()?;
            mirrors::daemon::run(paths, config).await?;
        }
        Command::Check { config } => check(&load(config)?)?,
        Command::Log { id, lines } => {
            let paths = Paths::new()?;
            let path = paths.site_log(&id);
            if !path.exists() {
                bail!("no log for site '{id}' at {}", path.display());
            }
            for line in mirrors::log::tail_file(&path, lines)? {
                println!("{line}");
            }
        }
        Command::Status { id } => {
            let paths = Paths::new()?;
            let response = mirrors::client::send_request(&paths, &Request::Status { id })?;
            print_response(&response, cli.json)?;
        }
        Command::Kill => {
            let paths = Paths::new()?;
            let response = mirrors::client::send_request(&paths, &Request::Kill)?;
            print_response(&response, cli.json)?;
        }
    }

    Ok(())
}

fn load(config: Option<PathBuf>) -> color_eyre::Result<Config> {
    let path = config
        .or_else(Paths::default_config_file)
        .ok_or_else(|| eyre!("no --config given and no default config location"))?;
    config::load_config(&path).wrap_err_with(|| format!("failed to load {}", path.display()))
}

fn check(config: &Config) -> color_eyre::Result<()> {
    let mut invalid = 0;
    for site in &config.sites {
        match site.validate_schedule() {
            Ok(()) => println!(
                "{} {} {}",
                site.id.cyan().bold(),
                site.sched_type.dimmed(),
                site.sched_expr
            ),
            Err(e) => {
                invalid += 1;
                eprintln!("{} {}: {e}", "error:".red().bold(), site.id);
            }
        }
    }
    if invalid > 0 {
        bail!("{invalid} site(s) have an invalid schedule");
    }
    println!("{}", format!("{} site(s) ok", config.sites.len()).green());
    Ok(())
}

/// Error responses become a failed exit after printing.
fn print_response(response: &Response, json: bool) -> color_eyre::Result<()> {
    if json {
        println!("{}", serde_json::to_string(response)?);
        if let Response::Error { message } = response {
            bail!("{message}");
        }
        return Ok(());
    }
    match response {
        Response::Success { message } => {
            println!("{}", message.as_deref().unwrap_or("ok").green());
        }
        Response::Error { message } => bail!("{message}"),
        Response::Sites { sites } => {
            if sites.is_empty() {
                println!("{}", "no mirror sites configured".yellow());
            } else {
                println!("{}", sites_table(sites));
                for site in sites {
                    if let Some(error) = &site.error {
                        println!("{} {}: {error}", "disabled:".red().bold(), site.id);
                    }
                }
            }
        }
    }
    Ok(())
}

fn sites_table(sites: &[SiteStatus]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("id").add_attribute(Attribute::Bold),
        Cell::new("status").add_attribute(Attribute::Bold),
        Cell::new("progress").add_attribute(Attribute::Bold),
        Cell::new("last update").add_attribute(Attribute::Bold),
    ]);
    for site in sites {
        table.add_row(vec![
            Cell::new(&site.id).fg(Color::Cyan),
            Cell::new(site.update_status.to_string()).fg(status_color(site.update_status)),
            Cell::new(format_progress(site.update_progress)),
            Cell::new(format_last_update(site.last_update_time)),
        ]);
    }
    table
}

fn status_color(state: UpdateState) -> Color {
    match state {
        UpdateState::Idle => Color::Green,
        UpdateState::Initializing | UpdateState::Updating => Color::Yellow,
        UpdateState::Init => Color::Reset,
        UpdateState::InitFailed | UpdateState::UpdateFailed | UpdateState::Disabled => Color::Red,
    }
}

fn format_progress(progress: Option<u8>) -> String {
    match progress {
        Some(p) => format!("{p}%"),
        None => "-".to_string(),
    }
}

fn format_last_update(time: Option<NaiveDateTime>) -> String {
    time.map(format_datetime).unwrap_or_else(|| "never".to_string())
}
