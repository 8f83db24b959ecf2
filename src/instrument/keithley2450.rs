//! Keithley 2450 SourceMeter driver
//!
//! Translates a [`SweepPlan`] into the 2450's SCPI command set and runs the
//! sweep through the instrument's built-in trigger model:
//!
//! ```text
//! *RST, *CLS
//! :SOUR:FUNC VOLT                      source function
//! :SENS:FUNC "CURR"                    sense function
//! :SENS:CURR:RANG:AUTO ON              range handling
//! :SOUR:VOLT:ILIM 0.001                compliance
//! :SENS:CURR:NPLC 1                    integration time
//! :SENS:CURR:AZER ON                   autozero
//! :SENS:CURR:RSEN ON                   four-wire sensing
//! :SOUR:SWE:VOLT:LIN -1, 1, 21, -1, 1, BEST, OFF, OFF, "defbuffer1"
//! :SYST:ERR:COUN?                      reject on any queued error
//! ```
//!
//! Completion is detected by polling `:TRIG:STAT?`. Readings come back from
//! `defbuffer1` as `SOUR, READ, SOURSTAT` triples.

use super::{RawSample, SourceMeter};
use crate::adapters::{ScpiTransport, TcpScpiTransport};
use crate::error::{AppResult, SweepError};
use crate::plan::{FailurePolicy, RangeMode, SenseVariable, SourceVariable, SweepPlan, Wiring};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reading buffer used for sweeps.
pub const BUFFER_NAME: &str = "defbuffer1";
/// Trigger state poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Source status bit set when the reading was taken while the source was limited.
pub const SOURCE_STATUS_LIMITED: u32 = 0x02;

/// Current limit range accepted by the instrument, in amps.
const CURRENT_LIMIT_RANGE: (f64, f64) = (1e-9, 1.05);
/// Voltage limit range accepted by the instrument, in volts.
const VOLTAGE_LIMIT_RANGE: (f64, f64) = (0.02, 210.0);
/// Integration time range, in power-line cycles.
const NPLC_RANGE: (f64, f64) = (0.01, 10.0);

/// SCPI driver for the Keithley 2450.
pub struct Keithley2450<T: ScpiTransport> {
    name: String,
    transport: T,
    closed: bool,
}

impl Keithley2450<TcpScpiTransport> {
    /// Open a raw-socket connection and identify the instrument.
    ///
    /// # Errors
    /// [`SweepError::Connection`] if the instrument is unreachable.
    pub async fn connect(
        descriptor: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> AppResult<Self> {
        let transport = TcpScpiTransport::open(descriptor, connect_timeout, io_timeout).await?;
        let mut device = Self::with_transport(descriptor, transport);
        let idn = device.identify().await?;
        info!("Connected to {}: {}", descriptor, idn);
        Ok(device)
    }
}

impl<T: ScpiTransport> Keithley2450<T> {
    /// Wrap an already open transport.
    pub fn with_transport(name: impl Into<String>, transport: T) -> Self {
        Self {
            name: name.into(),
            transport,
            closed: false,
        }
    }

    /// Query `*IDN?`.
    pub async fn identify(&mut self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }

    /// Access the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed {
            Err(SweepError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Drain the instrument error queue.
    async fn read_errors(&mut self) -> AppResult<Vec<String>> {
        let count = parse_number(&self.transport.query(":SYST:ERR:COUN?").await?)? as usize;
        let mut errors = Vec::with_capacity(count);
        for _ in 0..count {
            errors.push(self.transport.query(":SYST:ERR:NEXT?").await?);
        }
        Ok(errors)
    }
}

/// Check the plan against what the instrument can physically do.
///
/// Runs before any command is sent, so a rejected plan leaves the instrument
/// untouched.
pub fn check_limits(plan: &SweepPlan) -> AppResult<()> {
    let (limit_range, source_max) = match plan.source() {
        SourceVariable::Voltage => (CURRENT_LIMIT_RANGE, VOLTAGE_LIMIT_RANGE.1),
        SourceVariable::Current => (VOLTAGE_LIMIT_RANGE, CURRENT_LIMIT_RANGE.1),
    };
    let unit = plan.sense().unit();
    if plan.compliance() < limit_range.0 || plan.compliance() > limit_range.1 {
        return Err(SweepError::DeviceConfig(format!(
            "compliance {}{} outside supported range {}{} to {}{}",
            plan.compliance(),
            unit,
            limit_range.0,
            unit,
            limit_range.1,
            unit
        )));
    }
    if plan.start().abs() > source_max || plan.end().abs() > source_max {
        return Err(SweepError::DeviceConfig(format!(
            "sweep span {} to {} exceeds source range +/-{}{}",
            plan.start(),
            plan.end(),
            source_max,
            plan.source().unit()
        )));
    }
    if plan.integration_cycles() < NPLC_RANGE.0 || plan.integration_cycles() > NPLC_RANGE.1 {
        return Err(SweepError::DeviceConfig(format!(
            "integration time {} NPLC outside supported range {} to {}",
            plan.integration_cycles(),
            NPLC_RANGE.0,
            NPLC_RANGE.1
        )));
    }
    Ok(())
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "ON"
    } else {
        "OFF"
    }
}

/// SCPI command sequence that applies `plan`.
pub fn configuration_commands(plan: &SweepPlan) -> Vec<String> {
    let (source_fn, sense_fn, limit_cmd) = match plan.source() {
        SourceVariable::Voltage => ("VOLT", "CURR", "ILIM"),
        SourceVariable::Current => ("CURR", "VOLT", "VLIM"),
    };
    let range_type = match plan.range_mode() {
        RangeMode::Fixed => "FIXED",
        RangeMode::Auto => "AUTO",
        RangeMode::Best => "BEST",
    };
    let fail_abort = plan.on_failure() == FailurePolicy::Abort;

    let mut cmds = vec![
        "*RST".to_string(),
        "*CLS".to_string(),
        format!(":SOUR:FUNC {}", source_fn),
        format!(":SENS:FUNC \"{}\"", sense_fn),
    ];

    match plan.range_mode() {
        RangeMode::Fixed => {
            cmds.push(format!(":SENS:{}:RANG:AUTO OFF", sense_fn));
            cmds.push(format!(":SENS:{}:RANG {}", sense_fn, plan.compliance()));
        }
        RangeMode::Auto | RangeMode::Best => {
            cmds.push(format!(":SENS:{}:RANG:AUTO ON", sense_fn));
        }
    }

    cmds.push(format!(
        ":SOUR:{}:{} {}",
        source_fn,
        limit_cmd,
        plan.compliance()
    ));
    cmds.push(format!(
        ":SENS:{}:NPLC {}",
        sense_fn,
        plan.integration_cycles()
    ));
    cmds.push(format!(":SENS:{}:AZER {}", sense_fn, on_off(plan.auto_zero())));
    cmds.push(format!(
        ":SENS:{}:RSEN {}",
        sense_fn,
        on_off(plan.wiring() == Wiring::FourWire)
    ));

    if plan.offset_compensation() {
        if plan.sense() == SenseVariable::Voltage {
            cmds.push(format!(":SENS:{}:OCOM ON", sense_fn));
        } else {
            warn!("Offset compensation only applies when sensing voltage; ignored");
        }
    }

    // Dual sweeps are run as two separate trigger models, never the built-in dual flag.
    cmds.push(format!(
        ":SOUR:SWE:{}:LIN {}, {}, {}, {}, 1, {}, {}, OFF, \"{}\"",
        source_fn,
        plan.start(),
        plan.end(),
        plan.point_count(),
        plan.step_delay().as_seconds(),
        range_type,
        on_off(fail_abort),
        BUFFER_NAME
    ));

    cmds
}

fn invalid_response(message: String) -> SweepError {
    SweepError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

/// Parse one numeric SCPI field (`+1.000000E-03`, ` 21 `, ...).
pub fn parse_number(field: &str) -> AppResult<f64> {
    let trimmed = field.trim().trim_matches('"');
    trimmed
        .parse::<f64>()
        .map_err(|_| invalid_response(format!("unparseable numeric response '{}'", trimmed)))
}

/// Parse a `SOUR, READ, SOURSTAT` buffer dump.
pub fn parse_buffer(response: &str) -> AppResult<Vec<RawSample>> {
    let fields: Vec<&str> = response
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .collect();
    if fields.len() % 3 != 0 {
        return Err(invalid_response(format!(
            "buffer response has {} fields, expected a multiple of 3",
            fields.len()
        )));
    }

    fields
        .chunks_exact(3)
        .map(|triple| {
            let status = parse_number(triple[2])? as u32;
            Ok(RawSample {
                source: parse_number(triple[0])?,
                reading: parse_number(triple[1])?,
                in_compliance: status & SOURCE_STATUS_LIMITED != 0,
            })
        })
        .collect()
}

#[async_trait]
impl<T: ScpiTransport> SourceMeter for Keithley2450<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply_configuration(&mut self, plan: &SweepPlan) -> AppResult<()> {
        self.ensure_open()?;
        check_limits(plan)?;

        for cmd in configuration_commands(plan) {
            self.transport.write(&cmd).await?;
        }

        let errors = self.read_errors().await?;
        if !errors.is_empty() {
            return Err(SweepError::DeviceConfig(errors.join("; ")));
        }
        debug!("{} configured: {}", self.name, plan);
        Ok(())
    }

    async fn trigger(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        self.transport.write(":INIT").await
    }

    async fn wait_for_completion(&mut self, deadline: Instant) -> AppResult<()> {
        self.ensure_open()?;
        let started = Instant::now();
        loop {
            let state = self.transport.query(":TRIG:STAT?").await?;
            let head = state.split(';').next().unwrap_or("").trim().to_ascii_uppercase();
            match head.as_str() {
                "IDLE" | "EMPTY" => return Ok(()),
                "ABORTED" | "FAILED" => {
                    warn!("{} trigger model ended as {}", self.name, head);
                    return Ok(());
                }
                _ => {}
            }

            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(SweepError::SweepTimeout {
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn fetch_samples(&mut self, expected: usize) -> AppResult<Vec<RawSample>> {
        self.ensure_open()?;
        let available = parse_number(
            &self
                .transport
                .query(&format!(":TRAC:ACT? \"{}\"", BUFFER_NAME))
                .await?,
        )? as usize;
        let count = available.min(expected);
        if count == 0 {
            return Ok(Vec::new());
        }

        let response = self
            .transport
            .query(&format!(
                ":TRAC:DATA? 1, {}, \"{}\", SOUR, READ, SOURSTAT",
                count, BUFFER_NAME
            ))
            .await?;
        parse_buffer(&response)
    }

    async fn abort(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.transport.write(":ABOR").await
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.transport.write(":OUTP OFF").await {
            warn!("{} failed to switch output off: {}", self.name, e);
        }
        info!("Disconnecting from {}.", self.name);
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SweepParameters;
    use std::collections::VecDeque;

    /// Records writes and answers queries from a script.
    #[derive(Default)]
    struct ScriptedTransport {
        sent: Vec<String>,
        responses: VecDeque<String>,
        closed: bool,
    }

    impl ScriptedTransport {
        fn answering(responses: &[&str]) -> Self {
            Self {
                responses: responses.iter().map(|r| r.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ScpiTransport for ScriptedTransport {
        async fn write(&mut self, cmd: &str) -> AppResult<()> {
            self.sent.push(cmd.to_string());
            Ok(())
        }

        async fn query(&mut self, cmd: &str) -> AppResult<String> {
            self.sent.push(cmd.to_string());
            self.responses
                .pop_front()
                .ok_or_else(|| SweepError::Io(std::io::ErrorKind::TimedOut.into()))
        }

        async fn close(&mut self) -> AppResult<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn plan() -> SweepPlan {
        SweepParameters {
            start: -1.0,
            end: -0.5,
            point_count: 21,
            compliance: 1e-5,
            integration_cycles: 3.0,
            step_delay: 0.002,
            on_failure: "abort".into(),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    #[test]
    fn test_configuration_commands_for_voltage_sweep() {
        let cmds = configuration_commands(&plan());
        assert_eq!(cmds[0], "*RST");
        assert!(cmds.contains(&":SOUR:FUNC VOLT".to_string()));
        assert!(cmds.contains(&":SENS:FUNC \"CURR\"".to_string()));
        assert!(cmds.contains(&":SOUR:VOLT:ILIM 0.00001".to_string()));
        assert!(cmds.contains(&":SENS:CURR:NPLC 3".to_string()));
        assert!(cmds.contains(&":SENS:CURR:RSEN ON".to_string()));
        assert_eq!(
            cmds.last().unwrap(),
            ":SOUR:SWE:VOLT:LIN -1, -0.5, 21, 0.002, 1, BEST, ON, OFF, \"defbuffer1\""
        );
    }

    #[test]
    fn test_configuration_commands_for_current_sweep() {
        let plan = SweepParameters {
            source: "current".into(),
            start: 0.0,
            end: 1e-5,
            compliance: 0.2,
            wiring: "two-wire".into(),
            range: "fixed".into(),
            offset_compensation: true,
            ..Default::default()
        }
        .validate()
        .unwrap();
        let cmds = configuration_commands(&plan);
        assert!(cmds.contains(&":SOUR:CURR:VLIM 0.2".to_string()));
        assert!(cmds.contains(&":SENS:VOLT:RANG 0.2".to_string()));
        assert!(cmds.contains(&":SENS:VOLT:RSEN OFF".to_string()));
        assert!(cmds.contains(&":SENS:VOLT:OCOM ON".to_string()));
        assert!(cmds.last().unwrap().contains(", -1, 1, FIXED, OFF, OFF,"));
    }

    #[test]
    fn test_check_limits_rejects_unsupported_compliance() {
        let plan = SweepParameters {
            compliance: 5.0,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert!(matches!(
            check_limits(&plan),
            Err(SweepError::DeviceConfig(_))
        ));
    }

    #[test]
    fn test_parse_buffer_flags_limited_points() {
        let samples =
            parse_buffer("-1.000000E+00,-1.0E-06,0, +0.0,0.0,0,1.0,+1.000000E-05,2").unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].source, -1.0);
        assert!(!samples[1].in_compliance);
        assert!(samples[2].in_compliance);
        assert!(parse_buffer("1.0,2.0").is_err());
    }

    #[tokio::test]
    async fn test_apply_configuration_surfaces_instrument_errors() {
        let transport =
            ScriptedTransport::answering(&["1", "-222,\"Parameter data out of range\""]);
        let mut device = Keithley2450::with_transport("smu", transport);
        let result = device.apply_configuration(&plan()).await;
        match result {
            Err(SweepError::DeviceConfig(msg)) => assert!(msg.contains("out of range")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sweep_round_trip() {
        let transport = ScriptedTransport::answering(&[
            "0",
            "RUNNING;RUNNING;sweep",
            "IDLE;IDLE;sweep",
            "3",
            "-1,-1e-3,0,0,0,0,1,1e-3,0",
        ]);
        let mut device = Keithley2450::with_transport("smu", transport);
        device.apply_configuration(&plan()).await.unwrap();
        device.trigger().await.unwrap();
        device
            .wait_for_completion(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        let samples = device.fetch_samples(21).await.unwrap();
        assert_eq!(samples.len(), 3);
        assert!(device
            .transport()
            .sent
            .iter()
            .any(|c| c.starts_with(":TRAC:DATA? 1, 3,")));

        device.close().await.unwrap();
        device.close().await.unwrap();
        assert!(device.transport().closed);
        assert_eq!(
            device
                .transport()
                .sent
                .iter()
                .filter(|c| *c == ":OUTP OFF")
                .count(),
            1
        );
    }
}
