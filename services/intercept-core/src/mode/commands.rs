//! Command templates
//!
//! Turns a mode, its validated parameters and the arbiter's grant into the
//! argv pipeline the supervisor launches. Nothing here goes through a shell;
//! every value is a separate argument.

use crate::arbiter::Grant;
use crate::config::ToolPaths;
use crate::supervisor::{CommandSpec, Stage};

use super::{Gain, ModeKind, ParamError, ValidatedParams};

const TSHARK_FIELDS: [&str; 4] = [
    "wlan.bssid",
    "wlan.ssid",
    "wlan_radio.channel",
    "wlan_radio.signal_dbm",
];

const BEACON_FILTER: &str = "wlan.fc.type_subtype == 0x0008";

/// Build the pipeline for `kind`.
///
/// `grant` is `None` only for a sensor run against a remote `rtl_tcp` source,
/// which needs no local hardware.
pub fn build_command(
    kind: ModeKind,
    params: &ValidatedParams,
    grant: Option<&Grant>,
    tools: &ToolPaths,
) -> Result<CommandSpec, ParamError> {
    // an explicit index wins over the registry's device
    let device_index = params
        .device_index
        .or_else(|| grant.and_then(|g| g.index))
        .unwrap_or(0)
        .to_string();

    let spec = match kind {
        ModeKind::Pager => {
            let mut rtl_fm = Stage::from_tool(&tools.rtl_fm)
                .args(["-M", "fm", "-f"])
                .arg(mhz(params.frequency_mhz))
                .arg("-s")
                .arg(format!("{}", (params.bandwidth_khz * 1000.0).round() as u64));
            if let Gain::Db(db) = params.gain {
                rtl_fm = rtl_fm.arg("-g").arg(db.to_string());
            }
            let rtl_fm = rtl_fm
                .arg("-d")
                .arg(&device_index)
                .arg("-l")
                .arg(params.squelch.to_string())
                .arg("-p")
                .arg(params.ppm.to_string())
                .arg("-");

            let multimon = Stage::from_tool(&tools.multimon_ng).args([
                "-t", "raw", "-a", "POCSAG512", "-a", "POCSAG1200", "-a", "POCSAG2400", "-a", "FLEX",
                "-f", "alpha", "-",
            ]);
            CommandSpec::single(rtl_fm).pipe(multimon)
        }

        ModeKind::Sensor => {
            let source = match &params.remote {
                Some(remote) => format!("rtl_tcp:{}:{}", remote.host, remote.port),
                None => device_index.clone(),
            };
            let mut rtl_433 = Stage::from_tool(&tools.rtl_433)
                .arg("-d")
                .arg(source)
                .arg("-f")
                .arg(mhz(params.frequency_mhz));
            if let Gain::Db(db) = params.gain {
                rtl_433 = rtl_433.arg("-g").arg(db.to_string());
            }
            CommandSpec::single(
                rtl_433
                    .arg("-p")
                    .arg(params.ppm.to_string())
                    .args(["-F", "json", "-M", "time:iso"]),
            )
        }

        ModeKind::Adsb => {
            let mut dump1090 = Stage::from_tool(&tools.dump1090)
                .arg("--device-index")
                .arg(&device_index);
            if let Gain::Db(db) = params.gain {
                dump1090 = dump1090.arg("--gain").arg(db.to_string());
            }
            CommandSpec::single(dump1090.arg("--ppm").arg(params.ppm.to_string()))
        }

        ModeKind::ListeningPost => {
            let end = params.frequency_end_mhz.ok_or_else(|| ParamError::Invalid {
                field: "frequency_end_mhz",
                reason: "a scan range needs an end frequency".to_string(),
            })?;
            let mut rtl_power = Stage::from_tool(&tools.rtl_power).arg("-d").arg(&device_index);
            if let Gain::Db(db) = params.gain {
                rtl_power = rtl_power.arg("-g").arg(db.to_string());
            }
            CommandSpec::single(
                rtl_power
                    .arg("-p")
                    .arg(params.ppm.to_string())
                    .arg("-f")
                    .arg(format!(
                        "{}:{}:{}k",
                        mhz(params.frequency_mhz),
                        mhz(end),
                        params.step_khz
                    ))
                    .args(["-i", "1", "-"]),
            )
        }

        ModeKind::WifiScan => {
            let iface = grant
                .and_then(|g| g.interface.as_deref())
                .ok_or_else(|| ParamError::Invalid {
                    field: "interface",
                    reason: "no WiFi interface was resolved".to_string(),
                })?;
            let mut tshark = Stage::from_tool(&tools.tshark)
                .arg("-i")
                .arg(iface)
                .args(["-l", "-T", "fields", "-E", "separator=/t"]);
            for field in TSHARK_FIELDS {
                tshark = tshark.arg("-e").arg(field);
            }
            CommandSpec::single(tshark.arg("-Y").arg(BEACON_FILTER))
        }

        ModeKind::BluetoothScan => {
            CommandSpec::single(Stage::from_tool(&tools.bluetoothctl).args(["scan", "on"]))
        }
    };

    Ok(spec)
}

fn mhz(freq: f64) -> String {
    format!("{}M", freq)
}
