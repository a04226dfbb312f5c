//! Observation hooks invoked by the processor while a chain runs.
//!
//! Diagnostics are purely observational: nothing a sink does can change the
//! flow of a run. The default sink, [`TracingDiagnostics`], forwards to
//! `tracing`.

use std::fmt::{self, Display};

use crate::{
    context::{DisplayTorrent, RunId, TorrentId},
    event::ProcessingEvent,
};

/// Identifies the stage a diagnostic refers to.
#[derive(Debug, Clone, Copy)]
pub struct StageInfo<'a> {
    pub run_id: RunId,
    pub torrent_id: Option<TorrentId>,
    pub stage: &'a str,
}

/// A failure raised by a stage, listener or finalizer.
#[derive(Debug, Clone, Copy)]
pub enum Fault<'a> {
    Error(&'a anyhow::Error),
    Panic(&'a str),
}

impl Display for Fault<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Error(err) => write!(f, "{err:#}"),
            Fault::Panic(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

pub trait Diagnostics: Send + Sync {
    fn stage_started(&self, info: StageInfo<'_>);

    fn stage_finished(&self, info: StageInfo<'_>);

    fn stage_failed(&self, info: StageInfo<'_>, fault: Fault<'_>);

    fn listener_failed(
        &self,
        info: StageInfo<'_>,
        event: ProcessingEvent,
        listener: &str,
        fault: Fault<'_>,
    );

    fn finalizer_failed(&self, run_id: RunId, torrent_id: Option<TorrentId>, fault: Fault<'_>);
}

/// Emits every diagnostic as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn stage_started(&self, info: StageInfo<'_>) {
        tracing::debug!(
            run = %info.run_id,
            torrent = %DisplayTorrent(info.torrent_id),
            stage = info.stage,
            "processing next stage"
        );
    }

    fn stage_finished(&self, info: StageInfo<'_>) {
        tracing::debug!(
            run = %info.run_id,
            torrent = %DisplayTorrent(info.torrent_id),
            stage = info.stage,
            "finished processing stage"
        );
    }

    fn stage_failed(&self, info: StageInfo<'_>, fault: Fault<'_>) {
        tracing::error!(
            run = %info.run_id,
            torrent = %DisplayTorrent(info.torrent_id),
            stage = info.stage,
            error = %fault,
            "processing failed"
        );
    }

    fn listener_failed(
        &self,
        info: StageInfo<'_>,
        event: ProcessingEvent,
        listener: &str,
        fault: Fault<'_>,
    ) {
        tracing::error!(
            run = %info.run_id,
            torrent = %DisplayTorrent(info.torrent_id),
            stage = info.stage,
            %event,
            listener,
            error = %fault,
            "listener invocation failed"
        );
    }

    fn finalizer_failed(&self, run_id: RunId, torrent_id: Option<TorrentId>, fault: Fault<'_>) {
        tracing::error!(
            run = %run_id,
            torrent = %DisplayTorrent(torrent_id),
            error = %fault,
            "context finalization failed"
        );
    }
}

#[cfg(test)]
pub(crate) mod test {
    //! Recording sink shared by the processor tests.

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Record {
        Started(String),
        Finished(String),
        StageFailed(String, String),
        ListenerFailed {
            stage: String,
            event: ProcessingEvent,
            listener: String,
            fault: String,
        },
        FinalizerFailed(String),
    }

    #[derive(Default)]
    pub(crate) struct RecordingDiagnostics {
        records: Mutex<Vec<Record>>,
    }

    impl RecordingDiagnostics {
        pub fn records(&self) -> Vec<Record> {
            self.records.lock().clone()
        }
    }

    impl Diagnostics for RecordingDiagnostics {
        fn stage_started(&self, info: StageInfo<'_>) {
            self.records.lock().push(Record::Started(info.stage.into()));
        }

        fn stage_finished(&self, info: StageInfo<'_>) {
            self.records.lock().push(Record::Finished(info.stage.into()));
        }

        fn stage_failed(&self, info: StageInfo<'_>, fault: Fault<'_>) {
            self.records
                .lock()
                .push(Record::StageFailed(info.stage.into(), fault.to_string()));
        }

        fn listener_failed(
            &self,
            info: StageInfo<'_>,
            event: ProcessingEvent,
            listener: &str,
            fault: Fault<'_>,
        ) {
            self.records.lock().push(Record::ListenerFailed {
                stage: info.stage.into(),
                event,
                listener: listener.into(),
                fault: fault.to_string(),
            });
        }

        fn finalizer_failed(&self, _: RunId, _: Option<TorrentId>, fault: Fault<'_>) {
            self.records
                .lock()
                .push(Record::FinalizerFailed(fault.to_string()));
        }
    }
}
