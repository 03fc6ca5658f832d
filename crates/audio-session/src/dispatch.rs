//! Write path for each session mode.

use std::sync::MutexGuard;

use crate::decode::{DecodeStep, OutputFormat};
use crate::error::{Result, SessionError};
use crate::hw::{PcmHandle, write_with_recovery};
use crate::queues::{PopEmpty, lock};
use crate::session::{
    DecodeState, ModeKind, OutputSession, Routes, SessionInner, SessionMode, SessionState,
    StreamShape,
};

impl OutputSession {
    /// Write stream data. Returns the number of caller bytes accepted.
    ///
    /// In tunnel mode this blocks while every pool buffer is in flight, until a
    /// period retires one, a flush skips the write (returns 0), or the session
    /// is stopped.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut guard = lock(&self.inner);
        if guard.state == SessionState::Stopped {
            return Err(SessionError::Stopped);
        }
        self.acquire_wake_lock(&mut guard);
        if guard.state == SessionState::Configured {
            guard.state = SessionState::Running;
        }
        match guard.mode.kind() {
            ModeKind::Tunnel => self.write_tunnel(guard, data),
            ModeKind::DecodeChain => self.write_decoded(&mut guard, data),
            ModeKind::DirectPcm => self.write_direct(&mut guard, data),
            ModeKind::Unconfigured => Err(SessionError::InvalidOperation(
                "session has no write path".to_string(),
            )),
        }
    }

    fn write_tunnel<'a>(
        &'a self,
        mut guard: MutexGuard<'a, SessionInner>,
        data: &[u8],
    ) -> Result<usize> {
        let (capacity, period) = {
            let inner = &mut *guard;
            let SessionMode::Tunnel(path) = &mut inner.mode else {
                return Err(SessionError::InvalidOperation("not a tunnel session".to_string()));
            };
            if path.config_pending {
                self.open_tunnel_handle(&mut inner.tunnel, path, &inner.shape, &inner.routes)?;
                if let Some(tunnel) = inner.tunnel.as_mut() {
                    tunnel.set_codec_params(data)?;
                }
                path.config_pending = false;
                tracing::debug!(bytes = data.len(), "tunnel codec configuration applied");
                return Ok(data.len());
            }
            let tunnel = inner.tunnel.as_ref().ok_or(SessionError::NoDevice("tunnel"))?;
            if !path.armed {
                if let (Some(timer), Some(event)) = (tunnel.period_timer(), inner.event.as_ref()) {
                    event.arm(timer);
                }
                path.armed = true;
            }
            let period = tunnel.period_bytes().max(1);
            let capacity = path
                .pool
                .map(|pool| pool.buffer_bytes())
                .ok_or(SessionError::NoDevice("tunnel buffers"))?;
            (capacity, period)
        };
        // Only a caller write shorter than one period marks end of stream,
        // never the tail piece of a longer write.
        let short = data.len() < period;

        // A zero-length write still queues one (empty) buffer as end of stream.
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(capacity).collect()
        };

        let mut accepted = 0;
        for chunk in chunks {
            let mut buf = match self.queues.try_pop_empty() {
                Some(buf) => buf,
                None => {
                    let token = self.queues.skip_token();
                    tracing::trace!("tunnel write waiting for a free buffer");
                    drop(guard);
                    let popped = self.queues.pop_empty(token);
                    guard = lock(&self.inner);
                    if guard.state == SessionState::Stopped {
                        return Err(SessionError::Stopped);
                    }
                    match popped {
                        PopEmpty::Buffer(mut buf) if self.queues.is_skipped(token) => {
                            buf.clear();
                            self.queues.push_empty(buf);
                            tracing::debug!("tunnel write skipped by flush");
                            return Ok(accepted);
                        }
                        PopEmpty::Buffer(buf) => buf,
                        PopEmpty::Skipped => {
                            tracing::debug!("tunnel write skipped by flush");
                            return Ok(accepted);
                        }
                        PopEmpty::Closed => return Err(SessionError::Stopped),
                    }
                }
            };

            buf.fill_from(chunk);
            self.queues.push_filled(buf);

            let inner = &mut *guard;
            let tunnel = inner.tunnel.as_mut().ok_or(SessionError::NoDevice("tunnel"))?;
            // The end-of-stream marker still goes out as one zero-length write.
            let pieces: Vec<&[u8]> = if chunk.is_empty() {
                vec![chunk]
            } else {
                chunk.chunks(period).collect()
            };
            for piece in pieces {
                write_with_recovery(tunnel.as_mut(), piece)?;
                if !piece.is_empty() {
                    inner.frame_count += 1;
                }
            }
            accepted += chunk.len();
        }

        if short {
            tracing::debug!(bytes = data.len(), "short tunnel write; signalling end of stream");
            let inner = &mut *guard;
            if let Some(event) = inner.event.as_ref() {
                event.signal_end_of_stream();
            }
            if let SessionMode::Tunnel(path) = &mut inner.mode {
                path.eos_signalled = true;
            }
            if let Some(tunnel) = inner.tunnel.as_mut() {
                if !tunnel.is_started() {
                    if let Err(e) = tunnel.start() {
                        tracing::error!("tunnel start failed: {e}");
                    }
                }
            }
        }
        Ok(accepted)
    }

    fn write_decoded(&self, inner: &mut SessionInner, data: &[u8]) -> Result<usize> {
        let SessionMode::DecodeChain(path) = &mut inner.mode else {
            return Err(SessionError::InvalidOperation("not a decode session".to_string()));
        };
        if path.adapter.needs_codec_config() {
            if let Err(e) = path.adapter.apply_codec_config(data) {
                tracing::warn!("codec configuration rejected: {e}");
            }
            return Ok(data.len());
        }
        if inner.routes.pcm && inner.pcm.is_none() {
            // A failed reconfigure left no handle; reopen before taking input.
            let target = path.adapter.output_format();
            self.reopen_pcm(&mut inner.pcm, &mut inner.shape, &inner.routes, target)?;
            path.state = DecodeState::Decoding;
        }
        if data.is_empty() {
            let pad = path.adapter.min_bytes();
            if pad == 0 {
                return Ok(0);
            }
            // Flush the decoder's tail at end of stream.
            path.adapter.pad_silence(pad);
        } else {
            path.adapter.push_input(data);
        }

        loop {
            let step = path.adapter.decode_step();
            if let DecodeStep::Empty { consumed } = step {
                path.empty_decodes += 1;
                tracing::trace!(consumed, "decode call produced no output");
            }

            let produced = path.adapter.output_format();
            let current = OutputFormat {
                sample_rate: inner.shape.sample_rate,
                channels: inner.shape.channels,
            };
            if inner.routes.pcm && inner.pcm.is_some() && produced != current {
                path.state = DecodeState::Reconfiguring {
                    from: current,
                    to: produced,
                };
                self.reopen_pcm(&mut inner.pcm, &mut inner.shape, &inner.routes, produced)?;
                path.state = DecodeState::Decoding;
            }

            match inner.pcm.as_mut() {
                Some(pcm) if inner.routes.pcm => {
                    let period = pcm.period_bytes();
                    while let Some(chunk) = path.adapter.next_period(period) {
                        write_with_recovery(pcm.as_mut(), chunk)?;
                        path.adapter.consume_output(period);
                        inner.frame_count += 1;
                    }
                }
                _ => path.adapter.discard_output(),
            }

            let more =
                matches!(step, DecodeStep::Produced { .. }) && path.adapter.has_enough_input();
            if !more {
                break;
            }
        }

        if inner.routes.a2dp {
            self.start_a2dp_bridge(inner)?;
        }
        Ok(data.len())
    }

    /// Close the PCM handle and reopen it at the decoder's new output format.
    fn reopen_pcm(
        &self,
        slot: &mut Option<Box<dyn PcmHandle>>,
        shape: &mut StreamShape,
        routes: &Routes,
        to: OutputFormat,
    ) -> Result<()> {
        tracing::info!(
            from_rate = shape.sample_rate,
            from_channels = shape.channels,
            to_rate = to.sample_rate,
            to_channels = to.channels,
            "decoder output format changed; reopening pcm handle"
        );
        if let Some(mut old) = slot.take() {
            if let Err(e) = old.close() {
                tracing::warn!("closing pcm handle for reconfigure failed: {e}");
            }
        }
        shape.sample_rate = to.sample_rate;
        shape.channels = to.channels;
        *slot = Some(self.open_pcm_handle(shape, routes)?);
        Ok(())
    }

    fn write_direct(&self, inner: &mut SessionInner, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let pcm = inner.pcm.as_mut().ok_or(SessionError::NoDevice("pcm"))?;
        let period = pcm.period_bytes().max(1);
        let mut sent = 0;
        for piece in data.chunks(period) {
            write_with_recovery(pcm.as_mut(), piece)?;
            inner.frame_count += 1;
            sent += piece.len();
        }
        if inner.routes.a2dp {
            self.start_a2dp_bridge(inner)?;
        }
        Ok(sent)
    }
}
