#![allow(clippy::result_large_err)]

use anyhow::{anyhow, Context};
use condor_monitor::config::{MonitorConfig, SiteRegistry};
use condor_monitor::producer::{self, PublishRequest};
use condor_monitor::telemetry;
use condor_monitor::transport::rabbitmq::ConnectOptions;
use condor_monitor::MonitorApp;
use std::path::PathBuf;

enum CliCommand {
    Run { job_conf: Option<PathBuf> },
    Publish { app_config: PathBuf, script: PathBuf },
    Validate { job_confs: Vec<PathBuf> },
    Help,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    match parse_cli_args(std::env::args().skip(1))? {
        CliCommand::Run { job_conf } => {
            let config = MonitorConfig::load().context("failed to load configuration")?;
            let app = MonitorApp::initialise(config).context("failed to construct application")?;
            app.run_once(job_conf.as_deref())
                .await
                .context("monitor run failed")?;
            Ok(())
        }
        CliCommand::Publish { app_config, script } => {
            let config = MonitorConfig::load().context("failed to load configuration")?;
            config.validate().context("invalid configuration")?;
            let request = PublishRequest {
                app_config,
                script,
                time_field: config.schema.time_field.clone(),
                destination_field: config.schema.destination_field.clone(),
                connect: ConnectOptions::from_settings(&config.poll),
            };
            producer::publish_once(&request)
                .await
                .context("failed to publish site status")?;
            Ok(())
        }
        CliCommand::Validate { job_confs } => run_validate_command(job_confs),
        CliCommand::Help => {
            print_help();
            Ok(())
        }
    }
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(first) = args.next() else {
        return Ok(CliCommand::Run { job_conf: None });
    };

    match first.as_str() {
        "publish" => return parse_publish_args(args),
        "validate" => {
            let job_confs: Vec<PathBuf> = args.map(PathBuf::from).collect();
            if job_confs.is_empty() {
                anyhow::bail!("condor-monitor validate requires at least one job config path");
            }
            return Ok(CliCommand::Validate { job_confs });
        }
        _ => {}
    }

    let mut job_conf = None;
    let mut pending = if first == "run" { None } else { Some(first) };

    loop {
        let arg = match pending.take() {
            Some(value) => value,
            None => match args.next() {
                Some(value) => value,
                None => break,
            },
        };

        match arg.as_str() {
            "-c" | "--config" => {
                if job_conf.is_some() {
                    anyhow::bail!("job config path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("expected path after {arg}"))?;
                job_conf = Some(PathBuf::from(value));
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            other if other.starts_with('-') => anyhow::bail!("unrecognised argument `{other}`"),
            _ => {
                if job_conf.is_some() {
                    anyhow::bail!("job config path specified multiple times");
                }
                job_conf = Some(PathBuf::from(&arg));
            }
        }
    }

    Ok(CliCommand::Run { job_conf })
}

fn parse_publish_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliCommand::Help),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let mut positional = positional.into_iter();
    match (positional.next(), positional.next(), positional.next()) {
        (Some(app_config), Some(script), None) => Ok(CliCommand::Publish { app_config, script }),
        _ => anyhow::bail!("usage: condor-monitor publish <APP_YML> <SCRIPT>"),
    }
}

fn run_validate_command(job_confs: Vec<PathBuf>) -> anyhow::Result<()> {
    let config = MonitorConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let mut had_error = false;
    for path in job_confs {
        match SiteRegistry::from_path(&path, &config.sites) {
            Ok(registry) if registry.is_empty() => {
                eprintln!("{}: no polling targets", path.display());
                had_error = true;
            }
            Ok(registry) => {
                println!("{}: {} polling target(s)", path.display(), registry.len());
                for site in registry.iter() {
                    println!("  - {} (vhost {})", site.name, site.virtual_host);
                }
            }
            Err(err) => {
                eprintln!("{}: {err}", path.display());
                had_error = true;
            }
        }
    }

    if had_error {
        Err(anyhow!("one or more job configs failed validation"))
    } else {
        Ok(())
    }
}

fn print_help() {
    println!(
        "\
Usage: condor-monitor [run] [OPTIONS] [JOB_CONF]
       condor-monitor publish <APP_YML> <SCRIPT>
       condor-monitor validate <JOB_CONF>...

Options:
  -c, --config <PATH>    Job configuration listing the runners (same as JOB_CONF)
  -h, --help             Print this help message

Settings are read from config/local.* and CONDOR_MONITOR__* variables.
"
    );
}
