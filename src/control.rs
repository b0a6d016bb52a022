// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Control-plane → dataplane API surface, `spec.md` §6.
//!
//! Grounded on `vqec_dpchan_api.h`: a flat request/response surface over a
//! handle table, plus the upcall/packet-eject channels `channel.rs` already
//! maintains per channel. `Control` is the one object a control-plane task
//! talks to; it owns the [`idtable::IdTable`] of live [`Channel`]s and the
//! module-wide configuration set at `module_init`.
//!
//! Per-IS `connect_os`/`bind_commit`/`bind_update`/`poll_data` model the
//! output-stream (“OS”) binding lifecycle `spec.md` §3 describes for channel
//! teardown (“destroy OS” as one of the ordered steps) and §6 names for each
//! input stream. Actual socket/reflector plumbing behind the OS is explicitly
//! out of scope (`spec.md` §1 "Packet I/O plumbing"), so this tracks only the
//! connect/commit state machine the control plane drives; `poll_data` for
//! `DpChan` is the one that does real work, forwarding to
//! [`Channel::poll_ev_handler`] since the reconstructed output is the one
//! flow this core actually produces.

use std::time::Duration;

use crate::channel::{Channel, ChannelConfig, ChannelStatus, Tr135Params, Tr135Sample};
use crate::config::{ModuleConfig, RccParams};
use crate::error::{bail, err, Error, ErrorInt, Result, StreamErrorReason};
use crate::fec::FecEngine;
use crate::idtable::{Handle, IdTable};
use crate::irq::{Device, Reason};
use crate::rtp::SourceKey;
use crate::scheduler::Sink;
use crate::sm::LogEntryPub;
use crate::stats::{GapEvent, RtpSessionStats};
use crate::time::Time;

/// Opaque channel handle returned by [`Control::channel_create`] (`spec.md`
/// §6 `channel_create(...) → channel_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Handle);

/// Per-channel construction parameters (`spec.md` §6 `channel_create(desc,
/// ...)`). MPEG TLV parsing knobs, histogram bounds, and pool sizing come
/// from [`ModuleConfig`] instead — they're module-wide, not per-channel
/// (`spec.md` §6 "Configuration knobs").
#[derive(Debug, Clone)]
pub struct ChannelDesc {
    pub primary_passthrough: bool,
    pub reorder_time: Duration,
    pub jitter_delay: Duration,
    pub repair_enabled: bool,
    pub fec_enabled: bool,
}

/// Output-stream (“OS”) bind-lifecycle state for one `(channel, device)`
/// pair — see module doc.
#[derive(Debug, Default, Clone, Copy)]
struct OsBinding {
    connected: bool,
    committed: bool,
}

fn device_index(d: Device) -> usize {
    match d {
        Device::Primary => 0,
        Device::Repair => 1,
        Device::DpChan => 2,
    }
}

struct ChannelEntry {
    channel: Channel,
    os: [OsBinding; 3],
}

/// The control-plane-facing handle indirection layer, `spec.md` §6.
///
/// Lifecycle mirrors the spec's explicit `module_init`/`module_deinit`
/// pair rather than being folded into construction/`Drop`, since every other
/// API call is only valid between the two (`spec.md` §7 "module lifecycle
/// violation").
pub struct Control {
    config: Option<ModuleConfig>,
    channels: IdTable<ChannelEntry>,
}

impl Control {
    pub fn new() -> Self {
        Control { config: None, channels: IdTable::new(0) }
    }

    /// `spec.md` §6 `module_init(params)`.
    pub fn module_init(&mut self, config: ModuleConfig) -> Result<()> {
        if self.config.is_some() {
            return Err(Error::from(ErrorInt::AlreadyInitialized));
        }
        self.channels = IdTable::new(config.max_channels);
        self.config = Some(config);
        Ok(())
    }

    /// `spec.md` §6 `module_deinit()`. Drops every live channel (and, with
    /// it, every sub-component each owns — plain field-drop order, since
    /// nothing here holds an external resource that needs the C source's
    /// explicit reverse-dependency teardown sequence).
    pub fn module_deinit(&mut self) -> Result<()> {
        self.require_config()?;
        self.channels = IdTable::new(0);
        self.config = None;
        Ok(())
    }

    fn require_config(&self) -> Result<&ModuleConfig> {
        self.config.as_ref().ok_or_else(|| Error::from(ErrorInt::NotInitialized))
    }

    fn entry_mut(&mut self, id: ChannelId) -> Result<&mut ChannelEntry> {
        self.channels.get_mut(id.0).ok_or_else(|| err!(NotFound, "channel {:?} not found", id.0))
    }

    fn entry(&self, id: ChannelId) -> Result<&ChannelEntry> {
        self.channels.get(id.0).ok_or_else(|| err!(NotFound, "channel {:?} not found", id.0))
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.entry_mut(id).map(|e| &mut e.channel)
    }

    fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.entry(id).map(|e| &e.channel)
    }

    /// `spec.md` §6 `channel_create(desc, out is_set, out os) → channel_id`.
    /// `is_set`/`os` aren't separate out-params here: the returned
    /// [`ChannelId`] is all a caller needs, since every IS/OS operation below
    /// is addressed by `(channel_id, device)`, not by a standalone handle.
    pub fn channel_create(&mut self, desc: ChannelDesc, fec_engine: Box<dyn FecEngine>) -> Result<ChannelId> {
        let config = self.require_config()?;
        let channel_cfg = ChannelConfig {
            primary_passthrough: desc.primary_passthrough,
            reorder_time: desc.reorder_time,
            jitter_delay: desc.jitter_delay,
            repair_enabled: desc.repair_enabled,
            fec_enabled: desc.fec_enabled,
            tlv: config.tlv,
            histogram_bounds_ns: config.histogram_bounds_ns.clone(),
            packet_pool_capacity: config.packet_pool_size,
        };
        let entry = ChannelEntry { channel: Channel::new(channel_cfg, fec_engine), os: [OsBinding::default(); 3] };
        self.channels.alloc(entry).map(ChannelId).ok_or_else(|| err!(NoResource, "channel id table exhausted"))
    }

    /// `spec.md` §6 `channel_destroy(id)`.
    pub fn channel_destroy(&mut self, id: ChannelId) -> Result<()> {
        self.channels.free(id.0).map(|_| ()).ok_or_else(|| err!(NotFound, "channel {:?} not found", id.0))
    }

    /// `spec.md` §6 `channel_update_source(id, primary_filter,
    /// repair_filter?)`: designates the sole packet-flow-permitted source
    /// for each stream and raises the matching `*_SOURCE_CHANGED` upcall.
    pub fn channel_update_source(&mut self, id: ChannelId, primary_filter: Option<SourceKey>, repair_filter: Option<SourceKey>) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if let Some(key) = primary_filter {
            entry.channel.primary.rtp.set_packet_flow_permitted(key);
            entry.channel.notify_source_changed(Device::Primary);
        }
        if let Some(key) = repair_filter {
            if let Some(repair) = entry.channel.repair.as_mut() {
                repair.rtp.set_packet_flow_permitted(key);
            }
            entry.channel.notify_source_changed(Device::Repair);
        }
        Ok(())
    }

    /// `spec.md` §4.9/§6 `process_app(channel_id, app_params, tsrap_bytes)`.
    pub fn process_app(&mut self, id: ChannelId, now: Time, rcc_params: RccParams, session_rtp_seq_num_offset: u32, tsrap_bytes: &[u8]) -> Result<()> {
        self.channel_mut(id)?.process_app(now, rcc_params, session_rtp_seq_num_offset, tsrap_bytes)
    }

    /// `spec.md` §6 `abort_rcc(channel_id)`.
    pub fn abort_rcc(&mut self, id: ChannelId, now: Time) -> Result<()> {
        self.channel_mut(id)?.abort_rcc(now);
        Ok(())
    }

    pub fn get_status(&self, id: ChannelId) -> Result<ChannelStatus> {
        Ok(self.channel(id)?.get_status())
    }

    pub fn get_stats_tr135_sample(&self, id: ChannelId, now: Time) -> Result<Tr135Sample> {
        Ok(self.channel(id)?.get_stats_tr135_sample(now))
    }

    pub fn set_tr135_params(&mut self, id: ChannelId, params: Tr135Params) -> Result<()> {
        self.channel_mut(id)?.set_tr135_params(params);
        Ok(())
    }

    pub fn clear_stats(&mut self, id: ChannelId) -> Result<()> {
        self.channel_mut(id)?.clear_stats();
        Ok(())
    }

    pub fn get_gap_report(&self, id: ChannelId) -> Result<Vec<GapEvent>> {
        Ok(self.channel(id)?.get_gap_report())
    }

    pub fn get_seqlogs(&self, id: ChannelId) -> Result<Vec<LogEntryPub>> {
        Ok(self.channel(id)?.get_seqlogs())
    }

    pub fn get_pat(&self, id: ChannelId) -> Result<Vec<u8>> {
        Ok(self.channel(id)?.get_pat().to_vec())
    }

    pub fn get_pmt(&self, id: ChannelId) -> Result<Vec<u8>> {
        Ok(self.channel(id)?.get_pmt().to_vec())
    }

    pub fn get_pcr(&self, id: ChannelId) -> Result<Option<u64>> {
        Ok(self.channel(id)?.get_pcr())
    }

    pub fn get_pts(&self, id: ChannelId) -> Result<Option<u64>> {
        Ok(self.channel(id)?.get_pts())
    }

    /// `spec.md` §4.9/§6 `ack_upcall_irq(channel_id, device, device_id, out
    /// resp)`. `device_id` isn't modeled separately: this core runs one
    /// input stream of each kind per channel, so `(channel_id, device)`
    /// already addresses a single IRQ descriptor.
    pub fn ack_upcall_irq(&mut self, id: ChannelId, dev: Device) -> Result<Reason> {
        Ok(self.channel_mut(id)?.ack_upcall_irq(dev))
    }

    /// `spec.md` §6 `poll_upcall_irq(channel_id, out poll)`: acknowledges all
    /// three devices at once, for use only when the control plane suspects
    /// lost upcall messages.
    pub fn poll_upcall_irq(&mut self, id: ChannelId) -> Result<[Reason; 3]> {
        Ok(self.channel_mut(id)?.poll_upcall_irq())
    }

    /// `spec.md` §6 per-IS `connect_os`.
    pub fn connect_os(&mut self, id: ChannelId, dev: Device) -> Result<()> {
        let os = &mut self.entry_mut(id)?.os[device_index(dev)];
        if os.connected {
            return Err(Error::from(ErrorInt::StreamError(StreamErrorReason::OutputStreamAlreadyConnected)));
        }
        os.connected = true;
        Ok(())
    }

    /// `spec.md` §6 per-IS `bind_commit`. Starts the output scheduler when
    /// committing the `DpChan` binding (`spec.md` §4.7: the scheduler "may be
    /// started" once its consumer is ready).
    pub fn bind_commit(&mut self, id: ChannelId, dev: Device) -> Result<()> {
        let entry = self.entry_mut(id)?;
        let os = &mut entry.os[device_index(dev)];
        if !os.connected {
            bail!(InvalidArgument, "cannot commit bind for {:?}: no OS connected", dev);
        }
        os.committed = true;
        if dev == Device::DpChan {
            entry.channel.start_output();
        }
        Ok(())
    }

    /// `spec.md` §6 per-IS `bind_update`. Real OS reconfiguration (changing
    /// the downstream reflector) is out-of-scope packet I/O; this validates
    /// the binding is live, matching the control plane's expectation that
    /// `bind_update` fails against an unbound stream.
    pub fn bind_update(&mut self, id: ChannelId, dev: Device) -> Result<()> {
        let os = &mut self.entry_mut(id)?.os[device_index(dev)];
        if !os.committed {
            bail!(InvalidArgument, "cannot update bind for {:?}: not committed", dev);
        }
        Ok(())
    }

    /// `spec.md` §6 per-IS `poll_data`. For `DpChan` this is the dataplane
    /// event-loop tick (`spec.md` §4.9 `poll_ev_handler`) that drains the
    /// output scheduler into `sink`. `Primary`/`Repair` forward their
    /// passthrough/STUN-eject traffic synchronously from their `receive_*`
    /// call, so there's nothing queued to poll.
    pub fn poll_data(&mut self, id: ChannelId, dev: Device, now: Time, sink: &mut dyn Sink) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if !entry.os[device_index(dev)].committed {
            bail!(InvalidArgument, "cannot poll {:?}: bind not committed", dev);
        }
        if dev == Device::DpChan {
            entry.channel.poll_ev_handler(now, sink);
        }
        Ok(())
    }

    pub fn get_rtp_stats(&self, id: ChannelId, dev: Device) -> Result<RtpSessionStats> {
        Ok(self.channel(id)?.get_rtp_stats(dev))
    }

    pub fn clear_rtp_stats(&mut self, id: ChannelId, dev: Device) -> Result<RtpSessionStats> {
        Ok(self.channel_mut(id)?.clear_rtp_stats(dev))
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlvParseConfig;
    use crate::fec::NullFecEngine;

    fn desc() -> ChannelDesc {
        ChannelDesc {
            primary_passthrough: true,
            reorder_time: Duration::from_millis(10),
            jitter_delay: Duration::from_millis(10),
            repair_enabled: true,
            fec_enabled: false,
        }
    }

    fn inited() -> Control {
        let mut c = Control::new();
        c.module_init(ModuleConfig {
            max_channels: 4,
            tlv: TlvParseConfig::default(),
            ..ModuleConfig::default()
        })
        .unwrap();
        c
    }

    #[test]
    fn calls_before_init_are_rejected() {
        let mut c = Control::new();
        let err = c.channel_create(desc(), Box::new(NullFecEngine)).unwrap_err();
        assert!(matches!(err.kind(), ErrorInt::NotInitialized));
    }

    #[test]
    fn double_init_is_rejected() {
        let mut c = inited();
        let err = c.module_init(ModuleConfig::default()).unwrap_err();
        assert!(matches!(err.kind(), ErrorInt::AlreadyInitialized));
    }

    #[test]
    fn create_destroy_roundtrip() {
        let mut c = inited();
        let id = c.channel_create(desc(), Box::new(NullFecEngine)).unwrap();
        assert!(c.get_status(id).is_ok());
        c.channel_destroy(id).unwrap();
        assert!(c.get_status(id).is_err());
    }

    #[test]
    fn unknown_channel_id_is_not_found() {
        let mut c = inited();
        let id = c.channel_create(desc(), Box::new(NullFecEngine)).unwrap();
        c.channel_destroy(id).unwrap();
        let err = c.abort_rcc(id, Time::ZERO).unwrap_err();
        assert!(matches!(err.kind(), ErrorInt::NotFound(_)));
    }

    #[test]
    fn os_bind_lifecycle_gates_commit_and_poll() {
        let mut c = inited();
        let id = c.channel_create(desc(), Box::new(NullFecEngine)).unwrap();

        // Can't commit before connecting.
        assert!(c.bind_commit(id, Device::DpChan).is_err());

        c.connect_os(id, Device::DpChan).unwrap();
        assert!(c.connect_os(id, Device::DpChan).is_err()); // already connected

        // Can't poll before committing.
        struct NullSink;
        impl Sink for NullSink {
            fn emit(&mut self, _pak: &crate::pak::PakData) {}
        }
        let mut sink = NullSink;
        assert!(c.poll_data(id, Device::DpChan, Time::ZERO, &mut sink).is_err());

        c.bind_commit(id, Device::DpChan).unwrap();
        assert!(c.poll_data(id, Device::DpChan, Time::from_millis(1), &mut sink).is_ok());
    }

    #[test]
    fn module_deinit_drops_live_channels() {
        let mut c = inited();
        let id = c.channel_create(desc(), Box::new(NullFecEngine)).unwrap();
        c.module_deinit().unwrap();
        assert!(c.get_status(id).is_err());
        let err = c.get_status(id).unwrap_err();
        assert!(matches!(err.kind(), ErrorInt::NotFound(_)));
    }
}
