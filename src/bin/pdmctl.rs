//! Command-line PDM client: loads (or bootstraps) a persisted pod record, opens a `TcpRadio`
//! to a pod (real or `pod-sim`), and drives one `PdmHandle` operation per invocation.
//!
//! Grounded on the teacher's `satbus.rs` — clap 2.x `App`/`SubCommand` tree, `colored` output,
//! one subcommand per domain operation — re-pointed at the PDM command set.

use clap::{App, Arg, SubCommand};
use colored::*;

use pdm_core::config::PdmConfig;
use pdm_core::error::OmnipyError;
use pdm_core::pod::{Hundredths, PodRecord, BASAL_SCHEDULE_LEN};
use pdm_core::radio::TcpRadio;
use pdm_core::storage::{JsonFileStore, PodStorage};
use pdm_core::{Pdm, PdmHandle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("pdmctl")
        .version("0.1.0")
        .author("Diabetes Therapy Systems Team")
        .about("Personal Diabetes Manager command-line client")
        .arg(
            Arg::with_name("pod-file")
                .long("pod-file")
                .value_name("PATH")
                .help("Path to the persisted pod record")
                .takes_value(true)
                .default_value("pod.json")
                .global(true),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Pod radio host")
                .takes_value(true)
                .default_value("127.0.0.1")
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .value_name("PORT")
                .help("Pod radio port")
                .takes_value(true)
                .default_value("8282")
                .global(true),
        )
        .arg(
            Arg::with_name("lot")
                .long("lot")
                .value_name("LOT")
                .help("Pod lot number, used when bootstrapping a new record")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            Arg::with_name("tid")
                .long("tid")
                .value_name("TID")
                .help("Pod serial number, used when bootstrapping a new record")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            Arg::with_name("address")
                .long("address")
                .value_name("HEX")
                .help("Pod radio address in hex, used when bootstrapping a new record")
                .takes_value(true)
                .default_value("cafebabe"),
        )
        .subcommand(SubCommand::with_name("status").about("Request a fresh pod status"))
        .subcommand(
            SubCommand::with_name("bolus")
                .about("Deliver an immediate bolus")
                .arg(Arg::with_name("amount").help("Bolus amount in units (e.g. 2.00)").required(true))
                .arg(Arg::with_name("beep").long("beep").help("Beep on delivery")),
        )
        .subcommand(
            SubCommand::with_name("cancel-bolus")
                .about("Cancel a running bolus")
                .arg(Arg::with_name("beep").long("beep").help("Beep on cancel")),
        )
        .subcommand(
            SubCommand::with_name("temp-basal")
                .about("Set a temporary basal rate")
                .arg(Arg::with_name("rate").help("Rate in units/hour (e.g. 1.00)").required(true))
                .arg(Arg::with_name("hours").help("Duration in hours (e.g. 2.0)").required(true))
                .arg(Arg::with_name("confidence-reminder").long("confidence-reminder")),
        )
        .subcommand(
            SubCommand::with_name("cancel-temp-basal")
                .about("Cancel a running temp basal")
                .arg(Arg::with_name("beep").long("beep").help("Beep on cancel")),
        )
        .subcommand(
            SubCommand::with_name("ack")
                .about("Acknowledge alerts")
                .arg(Arg::with_name("mask").help("Alert bitmask, e.g. 0x04").required(true)),
        )
        .subcommand(
            SubCommand::with_name("basal-schedule")
                .about("Set the basal schedule")
                .arg(
                    Arg::with_name("file")
                        .help("Path to a JSON array of 48 hourly rates in units/hour")
                        .required(true),
                ),
        )
        .subcommand(SubCommand::with_name("deactivate").about("Deactivate the pod"))
        .subcommand(SubCommand::with_name("busy").about("Report whether the pod is busy"))
        .get_matches();

    let pod_file = matches.value_of("pod-file").unwrap().to_string();
    let host = matches.value_of("host").unwrap().to_string();
    let port: u16 = matches.value_of("port").unwrap().parse()?;
    let lot: u32 = matches.value_of("lot").unwrap().parse()?;
    let tid: u32 = matches.value_of("tid").unwrap().parse()?;
    let address = u32::from_str_radix(matches.value_of("address").unwrap().trim_start_matches("0x"), 16)?;

    let storage = JsonFileStore::new(pod_file);
    let pod = match storage.load().await {
        Ok(pod) => pod,
        Err(_) => {
            println!("{}", "No persisted pod record found, bootstrapping a fresh one".dimmed());
            let mut pod = PodRecord::new(lot, tid);
            pod.address = Some(address);
            pod
        }
    };

    let config = PdmConfig::default();
    let radio = TcpRadio::new(format!("{host}:{port}"), pod.msg_sequence, pod.packet_sequence);
    let pdm = Pdm::new(pod, Box::new(radio), Box::new(storage), &config);
    let handle = PdmHandle::new(pdm);

    let result = match matches.subcommand() {
        ("status", _) => handle.update_pod_status(0).await,
        ("bolus", Some(sub)) => {
            let amount = parse_units(sub.value_of("amount").unwrap())?;
            handle.bolus(amount, sub.is_present("beep")).await
        }
        ("cancel-bolus", Some(sub)) => handle.cancel_bolus(sub.is_present("beep")).await,
        ("temp-basal", Some(sub)) => {
            let rate = parse_units(sub.value_of("rate").unwrap())?;
            let hours = parse_tenths(sub.value_of("hours").unwrap())?;
            handle.set_temp_basal(rate, hours, sub.is_present("confidence-reminder")).await
        }
        ("cancel-temp-basal", Some(sub)) => handle.cancel_temp_basal(sub.is_present("beep")).await,
        ("basal-schedule", Some(sub)) => {
            let raw = std::fs::read_to_string(sub.value_of("file").unwrap())?;
            let rates: Vec<f64> = serde_json::from_str(&raw)?;
            if rates.len() != BASAL_SCHEDULE_LEN {
                return Err(format!("schedule must have exactly {BASAL_SCHEDULE_LEN} entries, got {}", rates.len()).into());
            }
            let mut schedule = [0 as Hundredths; BASAL_SCHEDULE_LEN];
            for (slot, rate) in schedule.iter_mut().zip(rates) {
                *slot = (rate * 100.0).round() as Hundredths;
            }
            handle.set_basal_schedule(schedule).await
        }
        ("ack", Some(sub)) => {
            let mask_str = sub.value_of("mask").unwrap();
            let mask = if let Some(hex) = mask_str.strip_prefix("0x") {
                u8::from_str_radix(hex, 16)?
            } else {
                mask_str.parse()?
            };
            handle.acknowledge_alerts(mask).await
        }
        ("deactivate", _) => handle.deactivate_pod().await,
        ("busy", _) => {
            let busy = handle.is_busy().await;
            println!("{}", if busy { "busy".yellow() } else { "idle".green() });
            Ok(())
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            Ok(())
        }
    };

    match result {
        Ok(()) => {
            let pod = handle.pod_snapshot().await?;
            println!("{} {:?}", "ok".bright_green().bold(), pod.progress);
            Ok(())
        }
        Err(err) => {
            print_error(&err);
            std::process::exit(1);
        }
    }
}

fn print_error(err: &OmnipyError) {
    println!("{} {}", "error:".bright_red().bold(), err);
}

/// Parses a decimal units string (e.g. "2.00") into hundredths of a unit.
fn parse_units(s: &str) -> Result<Hundredths, Box<dyn std::error::Error>> {
    let value: f64 = s.parse()?;
    Ok((value * 100.0).round() as Hundredths)
}

/// Parses a decimal hours string (e.g. "2.0") into tenths of an hour.
fn parse_tenths(s: &str) -> Result<i32, Box<dyn std::error::Error>> {
    let value: f64 = s.parse()?;
    Ok((value * 10.0).round() as i32)
}

