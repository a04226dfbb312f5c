//! Chain execution: sequencing of stages, listener routing and finalization.

use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

use crate::{
    context::{DisplayTorrent, ProcessingContext, RunId, TorrentId},
    diagnostics::{Diagnostics, Fault, StageInfo, TracingDiagnostics},
    event::ProcessingEvent,
    executor::{panic_message, Executor},
    finalizer::{ContextFinalizer, FinalizerFailurePolicy},
    listener::{Listener, ListenerSource},
    stage::{StageError, StageRef},
};

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(
        "processing failed: run ({run_id}), torrent ({}), stage ({stage})",
        DisplayTorrent(*torrent_id)
    )]
    StageFailed {
        run_id: RunId,
        torrent_id: Option<TorrentId>,
        stage: String,
        #[source]
        source: StageError,
    },
    #[error(
        "stage panicked: run ({run_id}), torrent ({}), stage ({stage}): {message}",
        DisplayTorrent(*torrent_id)
    )]
    StagePanicked {
        run_id: RunId,
        torrent_id: Option<TorrentId>,
        stage: String,
        message: String,
    },
    #[error("context finalization failed: run ({run_id})")]
    FinalizerFailed {
        run_id: RunId,
        #[source]
        source: anyhow::Error,
    },
    #[error("run ({0}) was dropped by the executor before completing")]
    Aborted(RunId),
}

impl ProcessingError {
    pub fn run_id(&self) -> RunId {
        match self {
            Self::StageFailed { run_id, .. }
            | Self::StagePanicked { run_id, .. }
            | Self::FinalizerFailed { run_id, .. }
            | Self::Aborted(run_id) => *run_id,
        }
    }

    /// The error returned by the failing stage, exactly as the stage produced it.
    pub fn stage_error(&self) -> Option<&StageError> {
        match self {
            Self::StageFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn into_stage_error(self) -> Option<StageError> {
        match self {
            Self::StageFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Resolves once the run it was returned for has completed.
///
/// Success carries no value; failure carries the error of the stage that
/// ended the run. By the time the handle resolves the finalizer has already
/// been invoked.
#[must_use = "the outcome of the run is only observable through the handle"]
#[derive(Debug)]
pub struct ProcessingHandle {
    run_id: RunId,
    receiver: oneshot::Receiver<Result<(), ProcessingError>>,
}

impl ProcessingHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Blocks the current thread until the run completes.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn wait(self) -> Result<(), ProcessingError> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(ProcessingError::Aborted(self.run_id)))
    }
}

impl Future for ProcessingHandle {
    type Output = Result<(), ProcessingError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let run_id = self.run_id;
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(ProcessingError::Aborted(run_id))))
    }
}

/// Executes chains of stages starting from a fixed head stage.
///
/// Every [`submit`](Self::submit) schedules one run on the executor; the run
/// holds its worker until the chain ends, and transitions between stages
/// happen synchronously inside it. After each stage the listeners registered
/// for the stage's event may replace the default next stage:
///
/// - returning a stage when the default was `None` extends the chain;
/// - returning `None` when the default was a stage ends the chain early.
///
/// The processor puts no bound on how long listeners may keep a chain going.
/// A listener set that keeps rerouting into earlier stages will run forever
/// and hold its worker while doing so.
pub struct ChainProcessor<C: ProcessingContext> {
    chain: Chain<C>,
    executor: Arc<dyn Executor>,
}

impl<C: ProcessingContext> ChainProcessor<C> {
    pub fn new(chain_head: StageRef<C>, executor: impl Executor + 'static) -> Self {
        Self {
            chain: Chain {
                head: chain_head,
                finalizer: None,
                diagnostics: Arc::new(TracingDiagnostics),
                finalizer_failure: FinalizerFailurePolicy::default(),
            },
            executor: Arc::new(executor),
        }
    }

    pub fn with_finalizer(mut self, finalizer: impl ContextFinalizer<C> + 'static) -> Self {
        self.chain.finalizer = Some(Arc::new(finalizer));
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.chain.diagnostics = diagnostics;
        self
    }

    pub fn with_finalizer_failure_policy(mut self, policy: FinalizerFailurePolicy) -> Self {
        self.chain.finalizer_failure = policy;
        self
    }

    /// Schedules a run of the chain for `context`.
    pub fn submit(&self, context: C, listener_source: Arc<ListenerSource<C>>) -> ProcessingHandle {
        let run_id = RunId::new();
        let (sender, receiver) = oneshot::channel();
        let chain = self.chain.clone();
        tracing::trace!(
            run = %run_id,
            torrent = %DisplayTorrent(context.torrent_id()),
            "submitting run"
        );
        self.executor.execute(Box::new(move || {
            let mut context = context;
            let result = chain.run(run_id, &mut context, &listener_source);
            drop(context);
            if sender.send(result).is_err() {
                tracing::trace!(run = %run_id, "run handle dropped before completion");
            }
        }));
        ProcessingHandle { run_id, receiver }
    }

    /// Runs the chain for `context` on the calling thread.
    pub fn process(
        &self,
        context: &mut C,
        listener_source: &ListenerSource<C>,
    ) -> Result<(), ProcessingError> {
        self.chain.run(RunId::new(), context, listener_source)
    }
}

struct Chain<C: ProcessingContext> {
    head: StageRef<C>,
    finalizer: Option<Arc<dyn ContextFinalizer<C>>>,
    diagnostics: Arc<dyn Diagnostics>,
    finalizer_failure: FinalizerFailurePolicy,
}

impl<C: ProcessingContext> Clone for Chain<C> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            finalizer: self.finalizer.clone(),
            diagnostics: self.diagnostics.clone(),
            finalizer_failure: self.finalizer_failure,
        }
    }
}

fn stage_info<'a, C: ProcessingContext>(
    run_id: RunId,
    stage: &'a StageRef<C>,
    context: &C,
) -> StageInfo<'a> {
    StageInfo {
        run_id,
        torrent_id: context.torrent_id(),
        stage: stage.name(),
    }
}

impl<C: ProcessingContext> Chain<C> {
    fn run(
        &self,
        run_id: RunId,
        context: &mut C,
        listener_source: &ListenerSource<C>,
    ) -> Result<(), ProcessingError> {
        let mut current = Some(self.head.clone());
        while let Some(stage) = current {
            let listeners = stage
                .after()
                .map(|event| (event, listener_source.listeners(event)));

            let info = |context: &C| stage_info(run_id, &stage, context);

            self.observe(|sink| sink.stage_started(info(&*context)));
            let next = match catch_unwind(AssertUnwindSafe(|| stage.execute(context))) {
                Ok(Ok(next)) => next,
                Ok(Err(error)) => {
                    self.observe(|sink| {
                        sink.stage_failed(info(&*context), Fault::Error(&error))
                    });
                    self.finalize_after_failure(run_id, context);
                    return Err(ProcessingError::StageFailed {
                        run_id,
                        torrent_id: context.torrent_id(),
                        stage: stage.name().to_owned(),
                        source: error,
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    self.observe(|sink| {
                        sink.stage_failed(info(&*context), Fault::Panic(&message))
                    });
                    self.finalize_after_failure(run_id, context);
                    return Err(ProcessingError::StagePanicked {
                        run_id,
                        torrent_id: context.torrent_id(),
                        stage: stage.name().to_owned(),
                        message,
                    });
                }
            };
            self.observe(|sink| sink.stage_finished(info(&*context)));

            let next = match listeners {
                Some((event, listeners)) => {
                    self.route(info(&*context), event, listeners, context, next)
                }
                None => next,
            };

            if next.is_none() {
                self.finalize(run_id, context)?;
            }
            current = next;
        }
        Ok(())
    }

    /// Passes the proposed next stage through every listener in order.
    /// A failing listener leaves the proposal untouched.
    fn route(
        &self,
        info: StageInfo<'_>,
        event: ProcessingEvent,
        listeners: &[Listener<C>],
        context: &C,
        mut next: Option<StageRef<C>>,
    ) -> Option<StageRef<C>> {
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.apply(context, next.as_ref()))) {
                Ok(Ok(routed)) => next = routed,
                Ok(Err(error)) => {
                    self.observe(|sink| {
                        sink.listener_failed(info, event, listener.name(), Fault::Error(&error))
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    self.observe(|sink| {
                        sink.listener_failed(info, event, listener.name(), Fault::Panic(&message))
                    });
                }
            }
        }
        next
    }

    fn finalize(&self, run_id: RunId, context: &mut C) -> Result<(), ProcessingError> {
        let Some(finalizer) = &self.finalizer else {
            return Ok(());
        };
        let error = match catch_unwind(AssertUnwindSafe(|| finalizer.finalize(context))) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(error)) => {
                let torrent_id = context.torrent_id();
                self.observe(|sink| {
                    sink.finalizer_failed(run_id, torrent_id, Fault::Error(&error))
                });
                error
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                let torrent_id = context.torrent_id();
                self.observe(|sink| {
                    sink.finalizer_failed(run_id, torrent_id, Fault::Panic(&message))
                });
                anyhow::anyhow!("finalizer panicked: {message}")
            }
        };
        match self.finalizer_failure {
            FinalizerFailurePolicy::Log => Ok(()),
            FinalizerFailurePolicy::FailRun => Err(ProcessingError::FinalizerFailed {
                run_id,
                source: error,
            }),
        }
    }

    /// Hands a diagnostic to the sink. A panicking sink is logged and
    /// otherwise ignored.
    fn observe(&self, notify: impl FnOnce(&dyn Diagnostics)) {
        let sink = &*self.diagnostics;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| notify(sink))) {
            tracing::error!(
                panic = %panic_message(panic.as_ref()),
                "diagnostics sink panicked"
            );
        }
    }

    fn finalize_after_failure(&self, run_id: RunId, context: &mut C) {
        // the stage error is what the run reports
        if let Err(error) = self.finalize(run_id, context) {
            tracing::debug!(run = %run_id, %error, "finalizer failure superseded by stage failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        diagnostics::test::{Record, RecordingDiagnostics},
        executor::TokioExecutor,
        stage::{same_stage, BaseStage, ChainBuilder},
    };

    #[derive(Default)]
    struct Ctx {
        torrent_id: Option<TorrentId>,
        trace: Vec<&'static str>,
    }

    impl ProcessingContext for Ctx {
        fn torrent_id(&self) -> Option<TorrentId> {
            self.torrent_id
        }
    }

    fn stage(name: &'static str) -> BaseStage<Ctx> {
        BaseStage::new(name, move |ctx: &mut Ctx| {
            ctx.trace.push(name);
            Ok(())
        })
    }

    fn counting_finalizer(count: &Arc<AtomicUsize>) -> impl ContextFinalizer<Ctx> {
        let count = count.clone();
        move |_: &mut Ctx| -> anyhow::Result<()> {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn processor(head: StageRef<Ctx>, finalized: &Arc<AtomicUsize>) -> ChainProcessor<Ctx> {
        ChainProcessor::new(head, crate::executor::GlobalExecutor)
            .with_finalizer(counting_finalizer(finalized))
    }

    #[test]
    fn single_stage_chain_finalizes_once() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let processor = processor(stage("only").into_ref(), &finalized);
        let mut ctx = Ctx::default();
        processor.process(&mut ctx, &ListenerSource::new()).unwrap();
        assert_eq!(ctx.trace, ["only"]);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn linked_stages_run_in_order() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let head = ChainBuilder::new()
            .then(stage("handshake"))
            .then(stage("metadata"))
            .then(stage("pieces"))
            .then(stage("transfer"))
            .build()
            .unwrap();
        let processor = processor(head, &finalized);
        let mut ctx = Ctx::default();
        processor.process(&mut ctx, &ListenerSource::new()).unwrap();
        assert_eq!(ctx.trace, ["handshake", "metadata", "pieces", "transfer"]);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finalizer_runs_after_last_stage() {
        let head = ChainBuilder::new()
            .then(stage("first"))
            .then(stage("last"))
            .build()
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let finalizer = {
            let seen = seen.clone();
            move |ctx: &mut Ctx| -> anyhow::Result<()> {
                seen.lock().extend(ctx.trace.iter().copied());
                Ok(())
            }
        };
        let processor = ChainProcessor::new(head, crate::executor::GlobalExecutor)
            .with_finalizer(finalizer);
        processor
            .process(&mut Ctx::default(), &ListenerSource::new())
            .unwrap();
        assert_eq!(*seen.lock(), ["first", "last"]);
    }

    #[test]
    fn failing_stage_stops_the_chain() {
        #[derive(Debug, thiserror::Error, PartialEq)]
        #[error("bad handshake")]
        struct BadHandshake;

        let finalized = Arc::new(AtomicUsize::new(0));
        let head = ChainBuilder::new()
            .then(stage("connect"))
            .then(BaseStage::new("handshake", |ctx: &mut Ctx| {
                ctx.trace.push("handshake");
                Err(BadHandshake.into())
            }))
            .then(stage("transfer"))
            .build()
            .unwrap();
        let id = TorrentId::new([3; TorrentId::LEN]);
        let mut ctx = Ctx {
            torrent_id: Some(id),
            ..Default::default()
        };
        let err = processor(head, &finalized)
            .process(&mut ctx, &ListenerSource::new())
            .unwrap_err();

        assert_eq!(ctx.trace, ["connect", "handshake"]);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        match &err {
            ProcessingError::StageFailed {
                stage, torrent_id, ..
            } => {
                assert_eq!(stage, "handshake");
                assert_eq!(*torrent_id, Some(id));
            }
            other => panic!("unexpected error: {other}"),
        }
        let source = err.into_stage_error().unwrap();
        assert_eq!(source.downcast_ref::<BadHandshake>(), Some(&BadHandshake));
    }

    #[test]
    fn panicking_stage_is_fatal() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let head = BaseStage::new("explodes", |_: &mut Ctx| panic!("corrupt piece"))
            .with_next(stage("never").into_ref())
            .into_ref();
        let mut ctx = Ctx::default();
        let err = processor(head, &finalized)
            .process(&mut ctx, &ListenerSource::new())
            .unwrap_err();
        assert!(matches!(
            &err,
            ProcessingError::StagePanicked { stage, message, .. }
                if stage == "explodes" && message == "corrupt piece"
        ));
        assert!(ctx.trace.is_empty());
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_compose_in_registration_order() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let default_next = stage("default").into_ref();
        let first_choice = stage("first").into_ref();
        let second_choice = stage("second").into_ref();
        let head = stage("head")
            .with_event(ProcessingEvent::FilesChosen)
            .with_next(default_next.clone())
            .into_ref();

        let mut source = ListenerSource::<Ctx>::new();
        source
            .add_listener(ProcessingEvent::FilesChosen, {
                let default_next = default_next.clone();
                let first_choice = first_choice.clone();
                Listener::new(move |_, proposed| {
                    assert!(same_stage(proposed.unwrap(), &default_next));
                    Ok(Some(first_choice.clone()))
                })
            })
            .add_listener(ProcessingEvent::FilesChosen, {
                let first_choice = first_choice.clone();
                let second_choice = second_choice.clone();
                Listener::new(move |_, proposed| {
                    assert!(same_stage(proposed.unwrap(), &first_choice));
                    Ok(Some(second_choice.clone()))
                })
            });

        let mut ctx = Ctx::default();
        processor(head, &finalized)
            .process(&mut ctx, &source)
            .unwrap();
        assert_eq!(ctx.trace, ["head", "second"]);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_listener_keeps_previous_proposal() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let head = stage("head")
            .with_event(ProcessingEvent::MetadataExchanged)
            .with_next(stage("next").into_ref())
            .into_ref();
        let detour = stage("detour").into_ref();

        let mut source = ListenerSource::<Ctx>::new();
        source
            .add_listener(
                ProcessingEvent::MetadataExchanged,
                Listener::named("broken", |_, _| Err(anyhow::anyhow!("listener bug"))),
            )
            .add_listener(
                ProcessingEvent::MetadataExchanged,
                Listener::named("panicky", |_, _| panic!("listener panic")),
            )
            .add_listener(
                ProcessingEvent::MetadataExchanged,
                Listener::named("observer", |_, proposed| {
                    assert_eq!(proposed.map(|s| s.name().to_owned()).as_deref(), Some("next"));
                    Ok(proposed.cloned())
                }),
            );
        // unrelated event, must not be consulted
        source.add_listener(
            ProcessingEvent::DownloadComplete,
            Listener::new(move |_, _| Ok(Some(detour.clone()))),
        );

        let mut ctx = Ctx::default();
        processor(head, &finalized)
            .with_diagnostics(diagnostics.clone())
            .process(&mut ctx, &source)
            .unwrap();
        assert_eq!(ctx.trace, ["head", "next"]);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        let failures: Vec<_> = diagnostics
            .records()
            .into_iter()
            .filter(|r| matches!(r, Record::ListenerFailed { .. }))
            .collect();
        assert_eq!(
            failures,
            [
                Record::ListenerFailed {
                    stage: "head".into(),
                    event: ProcessingEvent::MetadataExchanged,
                    listener: "broken".into(),
                    fault: "listener bug".into(),
                },
                Record::ListenerFailed {
                    stage: "head".into(),
                    event: ProcessingEvent::MetadataExchanged,
                    listener: "panicky".into(),
                    fault: "panicked: listener panic".into(),
                },
            ]
        );
    }

    #[test]
    fn diagnostics_follow_stage_lifecycle() {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let head = ChainBuilder::new()
            .then(stage("a"))
            .then(BaseStage::new("b", |_: &mut Ctx| Err(anyhow::anyhow!("reset"))))
            .build()
            .unwrap();
        let processor = ChainProcessor::new(head, crate::executor::GlobalExecutor)
            .with_diagnostics(diagnostics.clone());
        assert!(processor
            .process(&mut Ctx::default(), &ListenerSource::new())
            .is_err());
        assert_eq!(
            diagnostics.records(),
            [
                Record::Started("a".into()),
                Record::Finished("a".into()),
                Record::Started("b".into()),
                Record::StageFailed("b".into(), "reset".into()),
            ]
        );
    }

    #[test]
    fn chain_without_finalizer_completes() {
        let processor = ChainProcessor::new(stage("a").into_ref(), crate::executor::GlobalExecutor);
        let mut ctx = Ctx::default();
        processor.process(&mut ctx, &ListenerSource::new()).unwrap();
        assert_eq!(ctx.trace, ["a"]);
    }

    #[test]
    fn finalizer_failure_is_logged_by_default() {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let processor = ChainProcessor::new(stage("a").into_ref(), crate::executor::GlobalExecutor)
            .with_diagnostics(diagnostics.clone())
            .with_finalizer(|_: &mut Ctx| -> anyhow::Result<()> { Err(anyhow::anyhow!("table locked")) });
        processor
            .process(&mut Ctx::default(), &ListenerSource::new())
            .unwrap();
        assert!(diagnostics
            .records()
            .contains(&Record::FinalizerFailed("table locked".into())));
    }

    #[test]
    fn finalizer_failure_can_fail_the_run() {
        let processor = ChainProcessor::new(stage("a").into_ref(), crate::executor::GlobalExecutor)
            .with_finalizer(|_: &mut Ctx| -> anyhow::Result<()> { panic!("finalizer bug") })
            .with_finalizer_failure_policy(FinalizerFailurePolicy::FailRun);
        let err = processor
            .process(&mut Ctx::default(), &ListenerSource::new())
            .unwrap_err();
        assert!(matches!(err, ProcessingError::FinalizerFailed { .. }));
        assert!(err.stage_error().is_none());
    }

    #[test]
    fn stage_error_wins_over_finalizer_error() {
        let processor = ChainProcessor::new(
            BaseStage::new("a", |_: &mut Ctx| Err(anyhow::anyhow!("stage"))).into_ref(),
            crate::executor::GlobalExecutor,
        )
        .with_finalizer(|_: &mut Ctx| -> anyhow::Result<()> { Err(anyhow::anyhow!("finalizer")) })
        .with_finalizer_failure_policy(FinalizerFailurePolicy::FailRun);
        let err = processor
            .process(&mut Ctx::default(), &ListenerSource::new())
            .unwrap_err();
        assert_eq!(err.stage_error().unwrap().to_string(), "stage");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[test_log::test]
    async fn submit_resolves_handle() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let processor = ChainProcessor::new(
            stage("a").into_ref(),
            TokioExecutor::new(tokio::runtime::Handle::current()),
        )
        .with_finalizer(counting_finalizer(&finalized));
        let handle = processor.submit(Ctx::default(), Arc::new(ListenerSource::new()));
        let run_id = handle.run_id();
        handle.await.unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        let failing = ChainProcessor::new(
            BaseStage::new("a", |_: &mut Ctx| Err(anyhow::anyhow!("boom"))).into_ref(),
            TokioExecutor::new(tokio::runtime::Handle::current()),
        );
        let err = failing
            .submit(Ctx::default(), Arc::new(ListenerSource::new()))
            .await
            .unwrap_err();
        assert_ne!(err.run_id(), run_id);
    }

    struct PanickingDiagnostics;

    impl Diagnostics for PanickingDiagnostics {
        fn stage_started(&self, _: StageInfo<'_>) {
            panic!("sink: started");
        }

        fn stage_finished(&self, _: StageInfo<'_>) {
            panic!("sink: finished");
        }

        fn stage_failed(&self, _: StageInfo<'_>, _: Fault<'_>) {
            panic!("sink: stage failed");
        }

        fn listener_failed(&self, _: StageInfo<'_>, _: ProcessingEvent, _: &str, _: Fault<'_>) {
            panic!("sink: listener failed");
        }

        fn finalizer_failed(&self, _: RunId, _: Option<TorrentId>, _: Fault<'_>) {
            panic!("sink: finalizer failed");
        }
    }

    #[test]
    fn panicking_diagnostics_do_not_affect_the_run() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let head = ChainBuilder::new()
            .then(stage("a").with_event(ProcessingEvent::HandshakeCompleted))
            .then(stage("b"))
            .build()
            .unwrap();
        let mut source = ListenerSource::new();
        source.add_listener(
            ProcessingEvent::HandshakeCompleted,
            Listener::new(|_, _| Err(anyhow::anyhow!("listener bug"))),
        );
        let source = Arc::new(source);

        let processor =
            processor(head, &finalized).with_diagnostics(Arc::new(PanickingDiagnostics));
        processor.submit(Ctx::default(), source.clone()).wait().unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        let failing = ChainProcessor::new(
            BaseStage::new("a", |_: &mut Ctx| Err(anyhow::anyhow!("reset"))).into_ref(),
            crate::executor::GlobalExecutor,
        )
        .with_finalizer(|_: &mut Ctx| -> anyhow::Result<()> { Err(anyhow::anyhow!("cleanup")) })
        .with_diagnostics(Arc::new(PanickingDiagnostics));
        let err = failing.submit(Ctx::default(), source).wait().unwrap_err();
        assert_eq!(err.stage_error().unwrap().to_string(), "reset");
    }

    #[test]
    fn global_executor_hosts_runs_without_ambient_runtime() {
        assert!(tokio::runtime::Handle::try_current().is_err());
        let finalized = Arc::new(AtomicUsize::new(0));
        let processor = processor(
            ChainBuilder::new()
                .then(stage("a"))
                .then(stage("b"))
                .build()
                .unwrap(),
            &finalized,
        );
        let listeners = Arc::new(ListenerSource::new());
        let handles: Vec<_> = (0..8)
            .map(|_| processor.submit(Ctx::default(), listeners.clone()))
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(finalized.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn dropped_job_aborts_run() {
        struct Rejecting;
        impl Executor for Rejecting {
            fn execute(&self, _job: crate::executor::Job) {}
        }

        let processor = ChainProcessor::new(stage("a").into_ref(), Rejecting);
        let handle = processor.submit(Ctx::default(), Arc::new(ListenerSource::new()));
        let run_id = handle.run_id();
        match handle.await {
            Err(ProcessingError::Aborted(id)) => assert_eq!(id, run_id),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
