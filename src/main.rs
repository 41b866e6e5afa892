#[macro_use]
extern crate log;

use std::{io, process::ExitCode};

use ice_gather_probe::{
    configuration::{Configuration, Parser},
    engine::IceGatherer,
    output::Reporter,
    probe::{ProbeOutcome, TimingProbe},
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        eprintln!("Invalid configuration: {}", e);
        return ExitCode::from(64);
    }

    info!("Configuration valid. Probing {}", conf.server_url);

    let probe = TimingProbe::new(conf.server_url.as_str(), conf.probe_settings());
    let options = conf.gather_options();
    let mut reporter = Reporter::new(io::stdout(), conf.output_format);

    match probe
        .run(|server| IceGatherer::new(server, options), &mut reporter)
        .await
    {
        Ok(report) if report.outcome == ProbeOutcome::TimedOut && conf.fail_on_timeout => {
            ExitCode::from(2)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR {}", e);
            ExitCode::FAILURE
        }
    }
}
