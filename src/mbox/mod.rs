//! Mailbox command construction, submission, and decoding.
//!
//! A [`Command`] is built unsent. The kernel's command support table is
//! queried lazily, on the first operation that needs payload sizes, and
//! cached for the command's lifetime. A command id absent from the table
//! parks the command in an unsupported state: every later operation fails
//! with [`Error::Unsupported`] without touching the payload buffers.
//!
//! Submission performs exactly one send ioctl and records the device's
//! status code. Typed accessors gate on three things before decoding: the
//! command id matches, the command was submitted, and the device reported
//! success. Device-reported failure is [`Error::Firmware`]; transport
//! failure surfaces from the ioctl itself.

pub mod transport;
pub mod wire;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::CxlContext;
use crate::error::{Error, Result};
use crate::topology::{partition_align, size_to_volatile, MemdevRef, PartitionType};
use transport::{CommandInfo, DeviceHandle, MboxTransport, SendCommand};
use wire::{EventLogType, FwTransferAction};

// ============================================================================
// Command ids
// ============================================================================

/// Kernel command ids, in UAPI enum order with the vendor extensions
/// appended after the last upstream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandId {
    Identify = 1,
    Raw = 2,
    GetSupportedLogs = 3,
    GetFwInfo = 4,
    GetPartitionInfo = 5,
    GetLsa = 6,
    GetHealthInfo = 7,
    GetLog = 8,
    SetPartitionInfo = 9,
    SetLsa = 10,
    GetAlertConfig = 11,
    SetAlertConfig = 12,
    GetShutdownState = 13,
    SetShutdownState = 14,
    GetPoison = 15,
    InjectPoison = 16,
    ClearPoison = 17,
    GetScanMediaCaps = 18,
    ScanMedia = 19,
    GetScanMedia = 20,
    TransferFw = 21,
    ActivateFw = 22,
    GetEventRecords = 23,
    ClearEventRecords = 24,
    GetTimestamp = 25,
    SetTimestamp = 26,
    Sanitize = 27,
}

impl CommandId {
    pub fn name(&self) -> &'static str {
        match self {
            CommandId::Identify => "identify",
            CommandId::Raw => "raw",
            CommandId::GetSupportedLogs => "get_supported_logs",
            CommandId::GetFwInfo => "get_fw_info",
            CommandId::GetPartitionInfo => "get_partition_info",
            CommandId::GetLsa => "get_lsa",
            CommandId::GetHealthInfo => "get_health_info",
            CommandId::GetLog => "get_log",
            CommandId::SetPartitionInfo => "set_partition_info",
            CommandId::SetLsa => "set_lsa",
            CommandId::GetAlertConfig => "get_alert_config",
            CommandId::SetAlertConfig => "set_alert_config",
            CommandId::GetShutdownState => "get_shutdown_state",
            CommandId::SetShutdownState => "set_shutdown_state",
            CommandId::GetPoison => "get_poison",
            CommandId::InjectPoison => "inject_poison",
            CommandId::ClearPoison => "clear_poison",
            CommandId::GetScanMediaCaps => "get_scan_media_caps",
            CommandId::ScanMedia => "scan_media",
            CommandId::GetScanMedia => "get_scan_media",
            CommandId::TransferFw => "transfer_fw",
            CommandId::ActivateFw => "activate_fw",
            CommandId::GetEventRecords => "get_event_records",
            CommandId::ClearEventRecords => "clear_event_records",
            CommandId::GetTimestamp => "get_timestamp",
            CommandId::SetTimestamp => "set_timestamp",
            CommandId::Sanitize => "sanitize",
        }
    }
}

// ============================================================================
// Command state machine
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum QueryState {
    NotRun,
    Supported(CommandInfo),
    Unsupported,
}

/// One mailbox command in flight. See the module docs for the lifecycle.
pub struct Command {
    transport: Arc<dyn MboxTransport>,
    dev: DeviceHandle,
    id: CommandId,
    query: QueryState,
    input: Vec<u8>,
    output: Vec<u8>,
    raw_opcode: u16,
    status: Option<u32>,
}

impl Command {
    pub(crate) fn new(transport: Arc<dyn MboxTransport>, dev: DeviceHandle, id: CommandId) -> Self {
        Command {
            transport,
            dev,
            id,
            query: QueryState::NotRun,
            input: Vec::new(),
            output: Vec::new(),
            raw_opcode: 0,
            status: None,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Whether the device advertises this command. `None` until the
    /// support table has been consulted.
    pub fn supported(&self) -> Option<bool> {
        match self.query {
            QueryState::NotRun => None,
            QueryState::Supported(_) => Some(true),
            QueryState::Unsupported => Some(false),
        }
    }

    /// Device status from the last submission, `None` if never submitted.
    pub fn status(&self) -> Option<u32> {
        self.status
    }

    fn unsupported_err(&self) -> Error {
        Error::unsupported(format!("{}: {}", self.dev.devname, self.id.name()))
    }

    /// Run (or recall) the support-table query and size the payload
    /// buffers from the declared sizes, unless the caller already
    /// overrode them.
    pub(crate) fn ensure_query(&mut self) -> Result<CommandInfo> {
        match self.query {
            QueryState::Supported(info) => return Ok(info),
            QueryState::Unsupported => return Err(self.unsupported_err()),
            QueryState::NotRun => {}
        }
        let table = self.transport.query(&self.dev)?;
        let Some(info) = table.find(self.id as u32) else {
            self.query = QueryState::Unsupported;
            return Err(self.unsupported_err());
        };
        debug!(
            memdev = self.dev.devname,
            command = self.id.name(),
            size_in = info.size_in,
            size_out = info.size_out,
            "command supported"
        );
        if self.input.is_empty() && info.size_in > 0 {
            self.input = vec![0u8; info.size_in as usize];
        }
        if self.output.is_empty() && info.size_out > 0 {
            self.output = vec![0u8; info.size_out as usize];
        }
        self.query = QueryState::Supported(info);
        Ok(info)
    }

    /// Replace the input payload, overriding the declared size. Bounded
    /// by the device's maximum relay size.
    pub fn set_input_payload(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_query()?;
        if data.len() > self.dev.payload_max {
            return Err(Error::invalid(format!(
                "input payload {} exceeds payload_max {}",
                data.len(),
                self.dev.payload_max
            )));
        }
        self.input = data.to_vec();
        Ok(())
    }

    /// Resize the output buffer, overriding the declared size. Bounded by
    /// the device's maximum relay size.
    pub fn set_output_size(&mut self, size: usize) -> Result<()> {
        self.ensure_query()?;
        if size > self.dev.payload_max {
            return Err(Error::invalid(format!(
                "output size {size} exceeds payload_max {}",
                self.dev.payload_max
            )));
        }
        self.output = vec![0u8; size];
        Ok(())
    }

    /// Perform the send ioctl once and record the device's status code.
    /// Returns the status; nonzero is a firmware-reported failure, left to
    /// the caller to interpret.
    pub fn submit(&mut self) -> Result<u32> {
        self.ensure_query()?;
        let mut send = SendCommand {
            id: self.id as u32,
            flags: 0,
            raw_opcode: self.raw_opcode,
            in_payload: std::mem::take(&mut self.input),
            out_payload: std::mem::take(&mut self.output),
        };
        let status = self.transport.send(&self.dev, &mut send)?;
        self.input = send.in_payload;
        self.output = send.out_payload;
        self.status = Some(status);
        if status != 0 {
            warn!(
                memdev = self.dev.devname,
                command = self.id.name(),
                status,
                "firmware status"
            );
        }
        Ok(status)
    }

    /// Submit and treat any nonzero device status as an error.
    pub fn run(&mut self) -> Result<()> {
        match self.submit()? {
            0 => Ok(()),
            status => Err(Error::Firmware { status }),
        }
    }

    /// Output payload gate used by every typed accessor.
    fn output_for(&self, id: CommandId) -> Result<&[u8]> {
        if matches!(self.query, QueryState::Unsupported) {
            return Err(self.unsupported_err());
        }
        if self.id != id {
            return Err(Error::invalid(format!(
                "command is {}, not {}",
                self.id.name(),
                id.name()
            )));
        }
        match self.status {
            None => Err(Error::invalid(format!("{}: not submitted", self.id.name()))),
            Some(0) => Ok(&self.output),
            Some(status) => Err(Error::Firmware { status }),
        }
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    pub fn identify(&self) -> Result<Identify> {
        Ok(Identify { raw: wire::IdentifyPayload::parse(self.output_for(CommandId::Identify)?)? })
    }

    pub fn health_info(&self) -> Result<HealthInfo> {
        Ok(HealthInfo {
            raw: wire::HealthInfoPayload::parse(self.output_for(CommandId::GetHealthInfo)?)?,
        })
    }

    pub fn alert_config(&self) -> Result<AlertConfig> {
        Ok(AlertConfig {
            raw: wire::AlertConfigPayload::parse(self.output_for(CommandId::GetAlertConfig)?)?,
        })
    }

    pub fn partition_info(&self) -> Result<PartitionInfo> {
        Ok(PartitionInfo {
            raw: wire::PartitionInfoPayload::parse(
                self.output_for(CommandId::GetPartitionInfo)?,
            )?,
        })
    }

    pub fn fw_info(&self) -> Result<FwInfo> {
        Ok(FwInfo { raw: wire::FwInfoPayload::parse(self.output_for(CommandId::GetFwInfo)?)? })
    }

    /// Label data returned by Get LSA.
    pub fn lsa_data(&self) -> Result<&[u8]> {
        self.output_for(CommandId::GetLsa)
    }

    /// Device clock in nanoseconds.
    pub fn timestamp(&self) -> Result<u64> {
        wire::parse_timestamp(self.output_for(CommandId::GetTimestamp)?)
    }

    /// Whether the last shutdown was dirty.
    pub fn shutdown_state_dirty(&self) -> Result<bool> {
        let state = wire::parse_shutdown_state(self.output_for(CommandId::GetShutdownState)?)?;
        Ok(state & wire::SHUTDOWN_STATE_DIRTY != 0)
    }

    pub fn event_records(&self) -> Result<EventRecords> {
        let buf = self.output_for(CommandId::GetEventRecords)?;
        let header = wire::EventRecordsHeader::parse(buf)?;
        Ok(EventRecords { header, buf: buf.to_vec() })
    }

    pub fn poison_list(&self) -> Result<Vec<wire::MediaErrorRecord>> {
        let buf = self.output_for(CommandId::GetPoison)?;
        let header = wire::PoisonListHeader::parse(buf)?;
        header.records(buf).map(wire::MediaErrorRecord::parse).collect()
    }

    /// Estimated scan time in milliseconds; zero means the device could
    /// not estimate the requested range.
    pub fn scan_media_estimate_ms(&self) -> Result<u32> {
        let buf = self.output_for(CommandId::GetScanMediaCaps)?;
        if buf.len() < 4 {
            return Err(Error::Parse("scan media caps: payload too short".into()));
        }
        Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }

    pub fn scan_media_results(&self) -> Result<ScanMediaResults> {
        let buf = self.output_for(CommandId::GetScanMedia)?;
        let header = wire::ScanMediaHeader::parse(buf)?;
        let records = header.records(buf).map(wire::MediaErrorRecord::parse).collect::<Result<_>>()?;
        Ok(ScanMediaResults { header, records })
    }

    /// Raw output bytes of a vendor passthrough command.
    pub fn raw_output(&self) -> Result<&[u8]> {
        self.output_for(CommandId::Raw)
    }
}

/// Decoded Get Event Records output: header plus the raw record payloads.
pub struct EventRecords {
    header: wire::EventRecordsHeader,
    buf: Vec<u8>,
}

impl EventRecords {
    pub fn overflow_err_count(&self) -> u16 {
        self.header.overflow_err_count
    }

    pub fn first_overflow_timestamp(&self) -> u64 {
        self.header.first_overflow_timestamp
    }

    pub fn last_overflow_timestamp(&self) -> u64 {
        self.header.last_overflow_timestamp
    }

    /// More records remain in the log after this batch.
    pub fn more_records(&self) -> bool {
        self.header.flags & wire::EVENT_MORE_RECORDS != 0
    }

    pub fn record_count(&self) -> u16 {
        self.header.record_count
    }

    pub fn records(&self) -> impl Iterator<Item = &[u8]> {
        self.header.records(&self.buf)
    }
}

/// Decoded Get Scan Media output.
pub struct ScanMediaResults {
    header: wire::ScanMediaHeader,
    records: Vec<wire::MediaErrorRecord>,
}

impl ScanMediaResults {
    pub fn records(&self) -> &[wire::MediaErrorRecord] {
        &self.records
    }

    pub fn more_records(&self) -> bool {
        self.header.flags & wire::SCAN_MEDIA_MORE_RECORDS != 0
    }

    pub fn stopped_prematurely(&self) -> bool {
        self.header.flags & wire::SCAN_MEDIA_STOPPED_PREMATURELY != 0
    }

    /// Where to restart a prematurely stopped scan.
    pub fn restart_range(&self) -> (u64, u64) {
        (self.header.restart_address, self.header.restart_length)
    }
}

// ============================================================================
// Typed payload views
// ============================================================================

/// Multi-state severity read from priority-ordered status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
    Critical,
    Unknown,
}

fn severity_from(value: u8) -> Severity {
    match value {
        0 => Severity::Normal,
        1 => Severity::Warning,
        2 => Severity::Critical,
        _ => Severity::Unknown,
    }
}

/// Decoded Identify output. Capacity getters convert from 256 MiB units
/// to bytes.
pub struct Identify {
    raw: wire::IdentifyPayload,
}

impl Identify {
    pub fn fw_revision(&self) -> String {
        wire::revision_str(&self.raw.fw_revision)
    }

    pub fn total_capacity(&self) -> u64 {
        self.raw.total_capacity * wire::CXL_CAPACITY_MULTIPLIER
    }

    pub fn volatile_only_capacity(&self) -> u64 {
        self.raw.volatile_only_capacity * wire::CXL_CAPACITY_MULTIPLIER
    }

    pub fn persistent_only_capacity(&self) -> u64 {
        self.raw.persistent_only_capacity * wire::CXL_CAPACITY_MULTIPLIER
    }

    pub fn partition_alignment(&self) -> u64 {
        self.raw.partition_alignment * wire::CXL_CAPACITY_MULTIPLIER
    }

    /// Capacity not pinned to either partition, available for splitting.
    pub fn available_capacity(&self) -> u64 {
        self.total_capacity() - self.volatile_only_capacity() - self.persistent_only_capacity()
    }

    pub fn lsa_size(&self) -> u32 {
        self.raw.lsa_size
    }

    pub fn event_log_size(&self, log: EventLogType) -> u16 {
        match log {
            EventLogType::Informational => self.raw.info_event_log_size,
            EventLogType::Warning => self.raw.warning_event_log_size,
            EventLogType::Failure => self.raw.failure_event_log_size,
            EventLogType::Fatal => self.raw.fatal_event_log_size,
        }
    }

    pub fn poison_list_max(&self) -> u32 {
        self.raw.poison_list_max
    }

    pub fn inject_poison_limit(&self) -> u16 {
        self.raw.inject_poison_limit
    }

    pub fn injects_persistent_poison(&self) -> bool {
        self.raw.poison_caps & wire::IDENTIFY_POISON_INJECTS_PERSISTENT != 0
    }

    pub fn scans_for_poison(&self) -> bool {
        self.raw.poison_caps & wire::IDENTIFY_POISON_SCANS_MEDIA != 0
    }

    pub fn qos_egress_port_congestion(&self) -> bool {
        self.raw.qos_telemetry_caps & wire::IDENTIFY_QOS_EGRESS_PORT_CONGESTION != 0
    }

    pub fn qos_temporary_throughput_reduction(&self) -> bool {
        self.raw.qos_telemetry_caps & wire::IDENTIFY_QOS_TEMPORARY_THROUGHPUT_REDUCTION != 0
    }
}

/// Decoded Get Health Info output.
pub struct HealthInfo {
    raw: wire::HealthInfoPayload,
}

impl HealthInfo {
    pub fn maintenance_needed(&self) -> bool {
        self.raw.health_status & wire::HEALTH_STATUS_MAINTENANCE_NEEDED != 0
    }

    pub fn performance_degraded(&self) -> bool {
        self.raw.health_status & wire::HEALTH_STATUS_PERFORMANCE_DEGRADED != 0
    }

    pub fn hw_replacement_needed(&self) -> bool {
        self.raw.health_status & wire::HEALTH_STATUS_HW_REPLACEMENT_NEEDED != 0
    }

    /// Raw media status code (0 = normal).
    pub fn media_status(&self) -> u8 {
        self.raw.media_status
    }

    pub fn life_used_severity(&self) -> Severity {
        severity_from(self.raw.ext_status & wire::HEALTH_EXT_LIFE_USED_MASK)
    }

    pub fn temperature_severity(&self) -> Severity {
        severity_from(
            (self.raw.ext_status & wire::HEALTH_EXT_TEMPERATURE_MASK)
                >> wire::HEALTH_EXT_TEMPERATURE_SHIFT,
        )
    }

    pub fn corrected_volatile_warning(&self) -> bool {
        self.raw.ext_status & wire::HEALTH_EXT_CORRECTED_VOLATILE_MASK != 0
    }

    pub fn corrected_persistent_warning(&self) -> bool {
        self.raw.ext_status & wire::HEALTH_EXT_CORRECTED_PERSISTENT_MASK != 0
    }

    /// Percentage of device life used. The device may not implement this.
    pub fn life_used(&self) -> Result<u8> {
        if self.raw.life_used == wire::NOT_IMPL_U8 {
            return Err(Error::unsupported("life_used not implemented"));
        }
        Ok(self.raw.life_used)
    }

    /// Device temperature in degrees Celsius. The device may not
    /// implement this.
    pub fn temperature(&self) -> Result<i16> {
        if self.raw.temperature == wire::NOT_IMPL_U16 {
            return Err(Error::unsupported("temperature not implemented"));
        }
        Ok(self.raw.temperature as i16)
    }

    pub fn dirty_shutdowns(&self) -> u32 {
        self.raw.dirty_shutdowns
    }

    pub fn volatile_errors(&self) -> u32 {
        self.raw.volatile_errors
    }

    pub fn pmem_errors(&self) -> u32 {
        self.raw.pmem_errors
    }
}

/// Alert selector shared by the Get and Set Alert Configuration views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    LifeUsed,
    OverTemperature,
    UnderTemperature,
    CorrectedVolatileError,
    CorrectedPmemError,
}

impl AlertEvent {
    fn bit(self) -> u8 {
        match self {
            AlertEvent::LifeUsed => wire::ALERT_LIFE_USED,
            AlertEvent::OverTemperature => wire::ALERT_OVER_TEMPERATURE,
            AlertEvent::UnderTemperature => wire::ALERT_UNDER_TEMPERATURE,
            AlertEvent::CorrectedVolatileError => wire::ALERT_CORRECTED_VOLATILE_ERR,
            AlertEvent::CorrectedPmemError => wire::ALERT_CORRECTED_PMEM_ERR,
        }
    }
}

/// Decoded Get Alert Configuration output.
pub struct AlertConfig {
    raw: wire::AlertConfigPayload,
}

impl AlertConfig {
    /// Whether the alert's threshold fields carry valid data.
    pub fn valid(&self, event: AlertEvent) -> bool {
        self.raw.valid_alerts & event.bit() != 0
    }

    /// Whether the alert's warning threshold is programmable.
    pub fn programmable(&self, event: AlertEvent) -> bool {
        self.raw.programmable_alerts & event.bit() != 0
    }

    pub fn life_used_critical_threshold(&self) -> u8 {
        self.raw.life_used_crit_alert_threshold
    }

    pub fn life_used_warning_threshold(&self) -> u8 {
        self.raw.life_used_prog_warn_threshold
    }

    pub fn over_temperature_critical_threshold(&self) -> u16 {
        self.raw.dev_over_temperature_crit_alert_threshold
    }

    pub fn under_temperature_critical_threshold(&self) -> u16 {
        self.raw.dev_under_temperature_crit_alert_threshold
    }

    pub fn over_temperature_warning_threshold(&self) -> u16 {
        self.raw.dev_over_temperature_prog_warn_threshold
    }

    pub fn under_temperature_warning_threshold(&self) -> u16 {
        self.raw.dev_under_temperature_prog_warn_threshold
    }

    pub fn volatile_error_warning_threshold(&self) -> u16 {
        self.raw.corrected_volatile_mem_err_prog_warn_threshold
    }

    pub fn pmem_error_warning_threshold(&self) -> u16 {
        self.raw.corrected_pmem_err_prog_warn_threshold
    }
}

/// Decoded Get Partition Info output, converted to bytes.
pub struct PartitionInfo {
    raw: wire::PartitionInfoPayload,
}

impl PartitionInfo {
    pub fn active_volatile(&self) -> u64 {
        self.raw.active_volatile * wire::CXL_CAPACITY_MULTIPLIER
    }

    pub fn active_persistent(&self) -> u64 {
        self.raw.active_persistent * wire::CXL_CAPACITY_MULTIPLIER
    }

    pub fn next_volatile(&self) -> u64 {
        self.raw.next_volatile * wire::CXL_CAPACITY_MULTIPLIER
    }

    pub fn next_persistent(&self) -> u64 {
        self.raw.next_persistent * wire::CXL_CAPACITY_MULTIPLIER
    }
}

/// Decoded Get FW Info output.
pub struct FwInfo {
    raw: wire::FwInfoPayload,
}

impl FwInfo {
    pub fn slots_supported(&self) -> u8 {
        self.raw.slots_supported
    }

    pub fn active_slot(&self) -> u8 {
        self.raw.slot_info & wire::FW_INFO_SLOT_ACTIVE_MASK
    }

    pub fn staged_slot(&self) -> u8 {
        (self.raw.slot_info & wire::FW_INFO_SLOT_STAGED_MASK) >> wire::FW_INFO_SLOT_STAGED_SHIFT
    }

    pub fn online_activation_capable(&self) -> bool {
        self.raw.activation_caps & wire::FW_INFO_ONLINE_ACTIVATION != 0
    }

    /// Firmware revision of a 1-based slot.
    pub fn revision(&self, slot: u8) -> Result<String> {
        if slot == 0 || slot > self.raw.slots_supported || slot as usize > wire::FW_MAX_SLOTS {
            return Err(Error::invalid(format!("firmware slot {slot} out of range")));
        }
        Ok(wire::revision_str(&self.raw.revisions[slot as usize - 1]))
    }
}

// ============================================================================
// Builders and memdev-level operations
// ============================================================================

impl CxlContext {
    fn device_handle(&self, m: MemdevRef) -> DeviceHandle {
        let memdev = self.memdev(m);
        DeviceHandle {
            devname: memdev.devname().to_owned(),
            major: memdev.major(),
            minor: memdev.minor(),
            payload_max: memdev.payload_max(),
        }
    }

    /// Build a command: query the support table, then stage the payloads.
    /// A command the device does not support is returned parked rather
    /// than rejected, so callers see the unsupported error at use time.
    fn build_cmd(
        &self,
        m: MemdevRef,
        id: CommandId,
        input: Option<Vec<u8>>,
        output_size: Option<usize>,
    ) -> Result<Command> {
        let mut cmd = Command::new(self.transport(), self.device_handle(m), id);
        match cmd.ensure_query() {
            Ok(_) => {}
            Err(Error::Unsupported(_)) => return Ok(cmd),
            Err(e) => return Err(e),
        }
        if let Some(data) = input {
            cmd.set_input_payload(&data)?;
        }
        if let Some(size) = output_size {
            cmd.set_output_size(size)?;
        }
        Ok(cmd)
    }

    pub fn cmd_identify(&self, m: MemdevRef) -> Result<Command> {
        self.build_cmd(m, CommandId::Identify, None, None)
    }

    pub fn cmd_get_health_info(&self, m: MemdevRef) -> Result<Command> {
        self.build_cmd(m, CommandId::GetHealthInfo, None, None)
    }

    pub fn cmd_get_alert_config(&self, m: MemdevRef) -> Result<Command> {
        self.build_cmd(m, CommandId::GetAlertConfig, None, None)
    }

    /// Program one alert's warning threshold, or disable it.
    pub fn cmd_set_alert_config(
        &self,
        m: MemdevRef,
        event: AlertEvent,
        enable: bool,
        threshold: u16,
    ) -> Result<Command> {
        let mut payload = wire::SetAlertConfigPayload {
            valid_alert_actions: event.bit(),
            ..Default::default()
        };
        if enable {
            payload.enable_alert_actions = event.bit();
            match event {
                AlertEvent::LifeUsed => payload.life_used_prog_warn_threshold = threshold as u8,
                AlertEvent::OverTemperature => {
                    payload.dev_over_temperature_prog_warn_threshold = threshold
                }
                AlertEvent::UnderTemperature => {
                    payload.dev_under_temperature_prog_warn_threshold = threshold
                }
                AlertEvent::CorrectedVolatileError => {
                    payload.corrected_volatile_mem_err_prog_warn_threshold = threshold
                }
                AlertEvent::CorrectedPmemError => {
                    payload.corrected_pmem_err_prog_warn_threshold = threshold
                }
            }
        }
        self.build_cmd(m, CommandId::SetAlertConfig, Some(payload.emit()), None)
    }

    pub fn cmd_get_partition_info(&self, m: MemdevRef) -> Result<Command> {
        self.build_cmd(m, CommandId::GetPartitionInfo, None, None)
    }

    /// Request a partition split. `volatile_bytes` must already be
    /// partition-aligned; it is carried in 256 MiB units.
    pub fn cmd_set_partition_info(
        &self,
        m: MemdevRef,
        volatile_bytes: u64,
        immediate: bool,
    ) -> Result<Command> {
        let flags = if immediate { wire::SET_PARTITION_IMMEDIATE } else { 0 };
        let units = volatile_bytes / wire::CXL_CAPACITY_MULTIPLIER;
        self.build_cmd(m, CommandId::SetPartitionInfo, Some(wire::emit_set_partition(units, flags)), None)
    }

    pub fn cmd_get_lsa(&self, m: MemdevRef, offset: u32, length: u32) -> Result<Command> {
        self.build_cmd(
            m,
            CommandId::GetLsa,
            Some(wire::emit_get_lsa(offset, length)),
            Some(length as usize),
        )
    }

    pub fn cmd_set_lsa(&self, m: MemdevRef, offset: u32, data: &[u8]) -> Result<Command> {
        self.build_cmd(m, CommandId::SetLsa, Some(wire::emit_set_lsa(offset, data)), None)
    }

    pub fn cmd_get_fw_info(&self, m: MemdevRef) -> Result<Command> {
        self.build_cmd(m, CommandId::GetFwInfo, None, None)
    }

    /// One Transfer FW step. `offset` is in 128-byte blocks.
    pub fn cmd_transfer_fw(
        &self,
        m: MemdevRef,
        action: FwTransferAction,
        slot: u8,
        offset: u32,
        data: &[u8],
    ) -> Result<Command> {
        self.build_cmd(
            m,
            CommandId::TransferFw,
            Some(wire::emit_transfer_fw(action, slot, offset, data)),
            None,
        )
    }

    pub fn cmd_activate_fw(&self, m: MemdevRef, online: bool, slot: u8) -> Result<Command> {
        self.build_cmd(m, CommandId::ActivateFw, Some(wire::emit_activate_fw(online, slot)), None)
    }

    pub fn cmd_get_timestamp(&self, m: MemdevRef) -> Result<Command> {
        self.build_cmd(m, CommandId::GetTimestamp, None, Some(8))
    }

    pub fn cmd_set_timestamp(&self, m: MemdevRef, nanos: u64) -> Result<Command> {
        self.build_cmd(m, CommandId::SetTimestamp, Some(wire::emit_timestamp(nanos)), None)
    }

    pub fn cmd_get_shutdown_state(&self, m: MemdevRef) -> Result<Command> {
        self.build_cmd(m, CommandId::GetShutdownState, None, Some(1))
    }

    pub fn cmd_set_shutdown_state(&self, m: MemdevRef, clean: bool) -> Result<Command> {
        self.build_cmd(m, CommandId::SetShutdownState, Some(wire::emit_shutdown_state(clean)), None)
    }

    pub fn cmd_sanitize(&self, m: MemdevRef) -> Result<Command> {
        self.build_cmd(m, CommandId::Sanitize, None, None)
    }

    pub fn cmd_get_event_records(&self, m: MemdevRef, log: EventLogType) -> Result<Command> {
        let payload_max = self.memdev(m).payload_max();
        self.build_cmd(
            m,
            CommandId::GetEventRecords,
            Some(wire::emit_get_event_records(log)),
            Some(payload_max),
        )
    }

    pub fn cmd_clear_event_records(
        &self,
        m: MemdevRef,
        log: EventLogType,
        clear_all: bool,
        handle: u16,
    ) -> Result<Command> {
        self.build_cmd(
            m,
            CommandId::ClearEventRecords,
            Some(wire::emit_clear_event_records(log, clear_all, handle)),
            None,
        )
    }

    pub fn cmd_get_poison_list(&self, m: MemdevRef, address: u64, length: u64) -> Result<Command> {
        let payload_max = self.memdev(m).payload_max();
        self.build_cmd(
            m,
            CommandId::GetPoison,
            Some(wire::emit_poison_range(address, length)),
            Some(payload_max),
        )
    }

    pub fn cmd_inject_poison(&self, m: MemdevRef, address: u64) -> Result<Command> {
        self.build_cmd(m, CommandId::InjectPoison, Some(wire::emit_inject_poison(address)), None)
    }

    pub fn cmd_clear_poison(&self, m: MemdevRef, address: u64) -> Result<Command> {
        self.build_cmd(m, CommandId::ClearPoison, Some(wire::emit_clear_poison(address)), None)
    }

    pub fn cmd_get_scan_media_caps(
        &self,
        m: MemdevRef,
        address: u64,
        length: u64,
    ) -> Result<Command> {
        self.build_cmd(
            m,
            CommandId::GetScanMediaCaps,
            Some(wire::emit_poison_range(address, length)),
            Some(4),
        )
    }

    pub fn cmd_scan_media(
        &self,
        m: MemdevRef,
        address: u64,
        length: u64,
        flags: u8,
    ) -> Result<Command> {
        self.build_cmd(
            m,
            CommandId::ScanMedia,
            Some(wire::emit_scan_media(address, length, flags)),
            None,
        )
    }

    pub fn cmd_get_scan_media(&self, m: MemdevRef) -> Result<Command> {
        let payload_max = self.memdev(m).payload_max();
        self.build_cmd(m, CommandId::GetScanMedia, None, Some(payload_max))
    }

    /// Vendor passthrough: caller supplies the opcode and sizes directly,
    /// no payload-size inference.
    pub fn cmd_raw(
        &self,
        m: MemdevRef,
        opcode: u16,
        input: &[u8],
        output_size: usize,
    ) -> Result<Command> {
        let mut cmd = self.build_cmd(m, CommandId::Raw, None, None)?;
        if cmd.supported() == Some(false) {
            return Ok(cmd);
        }
        cmd.raw_opcode = opcode;
        cmd.set_input_payload(input)?;
        cmd.set_output_size(output_size)?;
        Ok(cmd)
    }

    // ------------------------------------------------------------------
    // Memdev-level conveniences
    // ------------------------------------------------------------------

    fn lsa_chunk(&self, m: MemdevRef) -> usize {
        self.memdev(m).payload_max().saturating_sub(wire::SET_LSA_HEADER_LEN)
    }

    /// Read a label storage area range, chunked to the device's payload
    /// limit.
    pub fn memdev_read_label(&self, m: MemdevRef, offset: u64, length: u64) -> Result<Vec<u8>> {
        let lsa_size = self.memdev(m).label_size();
        let end = match offset.checked_add(length) {
            Some(end) if end <= lsa_size => end,
            _ => {
                return Err(Error::invalid(format!(
                    "label read {offset:#x}+{length:#x} exceeds lsa size {lsa_size:#x}"
                )))
            }
        };
        let chunk = self.lsa_chunk(m) as u64;
        if chunk == 0 {
            return Err(Error::invalid("payload_max too small for label io"));
        }
        let mut out = Vec::with_capacity(length as usize);
        let mut cursor = offset;
        while cursor < end {
            let n = chunk.min(end - cursor) as u32;
            let mut cmd = self.cmd_get_lsa(m, cursor as u32, n)?;
            cmd.run()?;
            out.extend_from_slice(cmd.lsa_data()?);
            cursor += u64::from(n);
        }
        Ok(out)
    }

    /// Write a label storage area range, chunked to the device's payload
    /// limit.
    pub fn memdev_write_label(&self, m: MemdevRef, offset: u64, data: &[u8]) -> Result<()> {
        let lsa_size = self.memdev(m).label_size();
        if offset.checked_add(data.len() as u64).map_or(true, |end| end > lsa_size) {
            return Err(Error::invalid(format!(
                "label write {offset:#x}+{:#x} exceeds lsa size {lsa_size:#x}",
                data.len()
            )));
        }
        let chunk = self.lsa_chunk(m);
        if chunk == 0 {
            return Err(Error::invalid("payload_max too small for label io"));
        }
        let mut cursor = offset;
        for piece in data.chunks(chunk) {
            let mut cmd = self.cmd_set_lsa(m, cursor as u32, piece)?;
            cmd.run()?;
            cursor += piece.len() as u64;
        }
        Ok(())
    }

    /// Zero the whole label storage area.
    pub fn memdev_zero_label(&self, m: MemdevRef) -> Result<()> {
        let lsa_size = self.memdev(m).label_size();
        let zeros = vec![0u8; lsa_size as usize];
        self.memdev_write_label(m, 0, &zeros)
    }

    /// Repartition the device's capacity: translate the request into a
    /// volatile size, align it per the device's partition alignment, and
    /// submit Set Partition Info.
    pub fn memdev_set_partition(
        &self,
        m: MemdevRef,
        ty: PartitionType,
        size: Option<u64>,
        align: bool,
        immediate: bool,
    ) -> Result<()> {
        let mut id_cmd = self.cmd_identify(m)?;
        id_cmd.run()?;
        let identify = id_cmd.identify()?;
        let available = identify.available_capacity();
        let volatile = size_to_volatile(ty, size, available)?;
        let volatile = partition_align(ty, volatile, identify.partition_alignment(), available, align)?;
        let mut cmd = self.cmd_set_partition_info(m, volatile, immediate)?;
        cmd.run()
    }

    pub fn memdev_get_timestamp(&self, m: MemdevRef) -> Result<u64> {
        let mut cmd = self.cmd_get_timestamp(m)?;
        cmd.run()?;
        cmd.timestamp()
    }

    pub fn memdev_set_timestamp(&self, m: MemdevRef, nanos: u64) -> Result<()> {
        let mut cmd = self.cmd_set_timestamp(m, nanos)?;
        cmd.run()
    }

    /// Whether the device recorded its last shutdown as dirty.
    pub fn memdev_shutdown_state_dirty(&self, m: MemdevRef) -> Result<bool> {
        let mut cmd = self.cmd_get_shutdown_state(m)?;
        cmd.run()?;
        cmd.shutdown_state_dirty()
    }

    pub fn memdev_set_shutdown_state(&self, m: MemdevRef, clean: bool) -> Result<()> {
        let mut cmd = self.cmd_set_shutdown_state(m, clean)?;
        cmd.run()
    }

    pub fn memdev_sanitize(&self, m: MemdevRef) -> Result<()> {
        let mut cmd = self.cmd_sanitize(m)?;
        cmd.run()
    }

    /// Poison list for a device address range. The address is aligned
    /// down to the 64-byte poison granule; a range past the device's
    /// capacity is rejected.
    pub fn memdev_poison_list(
        &self,
        m: MemdevRef,
        address: u64,
        length: u64,
    ) -> Result<Vec<wire::MediaErrorRecord>> {
        let memdev = self.memdev(m);
        if address > memdev.ram_size() + memdev.pmem_size() {
            return Err(Error::invalid(format!(
                "poison range start {address:#x} past device capacity"
            )));
        }
        let address = address - address % wire::POISON_LENGTH_UNIT;
        let mut cmd = self.cmd_get_poison_list(m, address, length)?;
        cmd.run()?;
        cmd.poison_list()
    }

    /// Stream a firmware image to a slot, chunked to the largest
    /// 128-byte-aligned span the mailbox can relay.
    pub fn memdev_transfer_firmware(&self, m: MemdevRef, slot: u8, image: &[u8]) -> Result<()> {
        let payload_max = self.memdev(m).payload_max();
        let chunk = (payload_max & !(wire::FW_BLOCK_SIZE - 1))
            .saturating_sub(wire::TRANSFER_FW_HEADER_LEN);
        if chunk == 0 {
            return Err(Error::invalid("payload_max too small for firmware transfer"));
        }
        if image.len() % wire::FW_BLOCK_SIZE != 0 {
            return Err(Error::invalid(format!(
                "firmware image length {:#x} is not a multiple of {:#x}",
                image.len(),
                wire::FW_BLOCK_SIZE
            )));
        }
        let pieces: Vec<&[u8]> = image.chunks(chunk).collect();
        for (i, piece) in pieces.iter().enumerate() {
            let action = if pieces.len() == 1 {
                FwTransferAction::Full
            } else if i == 0 {
                FwTransferAction::Initiate
            } else if i == pieces.len() - 1 {
                FwTransferAction::End
            } else {
                FwTransferAction::Continue
            };
            let offset = (i * chunk / wire::FW_BLOCK_SIZE) as u32;
            let mut cmd = self.cmd_transfer_fw(m, action, slot, offset, piece)?;
            if let Err(e) = cmd.run() {
                let mut abort = self.cmd_transfer_fw(m, FwTransferAction::Abort, 0, 0, &[])?;
                let _ = abort.run();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn memdev_activate_firmware(&self, m: MemdevRef, online: bool, slot: u8) -> Result<()> {
        let mut cmd = self.cmd_activate_fw(m, online, slot)?;
        cmd.run()
    }

    /// Inject poison at an address, through the kernel debug interface
    /// rather than the mailbox.
    pub fn memdev_inject_poison(&self, m: MemdevRef, address: &str) -> Result<()> {
        let path = std::path::Path::new("/sys/kernel/debug/cxl")
            .join(self.memdev(m).devname())
            .join("inject_poison");
        self.io().write_attr(&path, address)
    }

    /// Clear injected poison at an address, through the kernel debug
    /// interface.
    pub fn memdev_clear_poison(&self, m: MemdevRef, address: &str) -> Result<()> {
        let path = std::path::Path::new("/sys/kernel/debug/cxl")
            .join(self.memdev(m).devname())
            .join("clear_poison");
        self.io().write_attr(&path, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use transport::QueryResult;

    struct ScriptedMailbox {
        table: Vec<CommandInfo>,
        queries: AtomicUsize,
        sends: AtomicUsize,
        response: Vec<u8>,
        status: u32,
    }

    impl ScriptedMailbox {
        fn new(table: Vec<CommandInfo>, response: Vec<u8>, status: u32) -> Self {
            ScriptedMailbox {
                table,
                queries: AtomicUsize::new(0),
                sends: AtomicUsize::new(0),
                response,
                status,
            }
        }
    }

    impl MboxTransport for ScriptedMailbox {
        fn query(&self, _dev: &DeviceHandle) -> crate::error::Result<QueryResult> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(QueryResult { commands: self.table.clone() })
        }

        fn send(&self, _dev: &DeviceHandle, cmd: &mut SendCommand) -> crate::error::Result<u32> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let n = self.response.len().min(cmd.out_payload.len());
            cmd.out_payload[..n].copy_from_slice(&self.response[..n]);
            cmd.out_payload.truncate(self.response.len().max(n));
            Ok(self.status)
        }
    }

    fn handle() -> DeviceHandle {
        DeviceHandle { devname: "mem0".into(), major: 248, minor: 0, payload_max: 4096 }
    }

    fn info(id: CommandId, size_in: i32, size_out: i32) -> CommandInfo {
        CommandInfo { id: id as u32, flags: 0, size_in, size_out }
    }

    #[test]
    fn query_runs_once_per_command() {
        let mbox = Arc::new(ScriptedMailbox::new(
            vec![info(CommandId::GetHealthInfo, 0, 18)],
            vec![0u8; 18],
            0,
        ));
        let mut cmd = Command::new(mbox.clone(), handle(), CommandId::GetHealthInfo);
        cmd.ensure_query().unwrap();
        cmd.set_output_size(18).unwrap();
        cmd.run().unwrap();
        let _ = cmd.health_info().unwrap();
        assert_eq!(mbox.queries.load(Ordering::SeqCst), 1);
        assert_eq!(mbox.sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsupported_command_parks() {
        let mbox = Arc::new(ScriptedMailbox::new(vec![], vec![], 0));
        let mut cmd = Command::new(mbox.clone(), handle(), CommandId::Sanitize);
        assert!(matches!(cmd.ensure_query(), Err(Error::Unsupported(_))));
        assert_eq!(cmd.supported(), Some(false));
        // Later operations keep failing without re-querying or sending.
        assert!(matches!(cmd.submit(), Err(Error::Unsupported(_))));
        assert!(matches!(cmd.set_input_payload(&[1]), Err(Error::Unsupported(_))));
        assert_eq!(mbox.queries.load(Ordering::SeqCst), 1);
        assert_eq!(mbox.sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn accessor_requires_matching_id_and_success() {
        let mbox = Arc::new(ScriptedMailbox::new(
            vec![info(CommandId::Identify, 0, wire::IdentifyPayload::LEN as i32)],
            vec![0u8; wire::IdentifyPayload::LEN],
            0,
        ));
        let mut cmd = Command::new(mbox, handle(), CommandId::Identify);
        // Not yet submitted.
        assert!(cmd.identify().is_err());
        cmd.run().unwrap();
        assert!(cmd.identify().is_ok());
        // Wrong-id accessor on a valid command.
        assert!(cmd.health_info().is_err());
    }

    #[test]
    fn firmware_status_surfaces_from_accessors() {
        let mbox = Arc::new(ScriptedMailbox::new(
            vec![info(CommandId::Identify, 0, wire::IdentifyPayload::LEN as i32)],
            vec![0u8; wire::IdentifyPayload::LEN],
            7,
        ));
        let mut cmd = Command::new(mbox, handle(), CommandId::Identify);
        assert_eq!(cmd.submit().unwrap(), 7);
        assert!(matches!(cmd.run(), Err(Error::Firmware { status: 7 })));
        assert!(matches!(cmd.identify(), Err(Error::Firmware { status: 7 })));
    }

    #[test]
    fn payload_overrides_are_bounded() {
        let mbox = Arc::new(ScriptedMailbox::new(
            vec![info(CommandId::SetLsa, -1, 0)],
            vec![],
            0,
        ));
        let mut cmd = Command::new(mbox, handle(), CommandId::SetLsa);
        assert!(cmd.set_input_payload(&vec![0u8; 4096]).is_ok());
        assert!(cmd.set_input_payload(&vec![0u8; 4097]).is_err());
        assert!(cmd.set_output_size(4097).is_err());
    }

    #[test]
    fn health_sentinels_translate_to_unsupported() {
        let mut payload = vec![0u8; wire::HealthInfoPayload::LEN];
        payload[3] = wire::NOT_IMPL_U8;
        payload[4..6].copy_from_slice(&wire::NOT_IMPL_U16.to_le_bytes());
        let mbox = Arc::new(ScriptedMailbox::new(
            vec![info(CommandId::GetHealthInfo, 0, 18)],
            payload,
            0,
        ));
        let mut cmd = Command::new(mbox, handle(), CommandId::GetHealthInfo);
        cmd.run().unwrap();
        let health = cmd.health_info().unwrap();
        assert!(matches!(health.life_used(), Err(Error::Unsupported(_))));
        assert!(matches!(health.temperature(), Err(Error::Unsupported(_))));
    }
}
