//! Watch wiring for one kind
//!
//! A [`SyncerRunner`] watches the kind on both clusters, turns every event
//! into a [`Request`], feeds the dedup queue and runs the bounded worker
//! pool over [`SyncController::reconcile`]. Extra sources added by a
//! [`ControllerModifier`](crate::types::ControllerModifier) and mapping
//! changes recorded by other replicas feed the same queue.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vsync_common::client::from_dynamic;
use vsync_common::{KubeObjectClient, ObjectKey, Result, SyncObject};

use crate::cache::Side;
use crate::dispatch::{run_workers, WorkQueue, WorkerOptions};
use crate::exclude::HostExclusion;
use crate::reconcile::SyncController;
use crate::types::Request;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> watcher::Config {
    watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)
}

/// A watch event reduced to what routing needs
#[derive(Clone, Debug, PartialEq)]
pub enum Observed<K> {
    /// Object was created or changed
    Applied(K),
    /// Object was deleted
    Deleted(K),
}

impl<K: SyncObject> Observed<K> {
    /// The observed object
    pub fn object(&self) -> &K {
        match self {
            Self::Applied(obj) | Self::Deleted(obj) => obj,
        }
    }
}

fn observe<K: SyncObject>(event: Event<kube::api::DynamicObject>) -> Vec<Observed<K>> {
    let (obj, deleted) = match event {
        Event::Apply(obj) | Event::InitApply(obj) => (obj, false),
        Event::Delete(obj) => (obj, true),
        Event::Init | Event::InitDone => return Vec::new(),
    };
    match from_dynamic::<K>(obj) {
        Ok(obj) if deleted => vec![Observed::Deleted(obj)],
        Ok(obj) => vec![Observed::Applied(obj)],
        Err(e) => {
            warn!(error = %e, "Dropping watch event that does not decode");
            Vec::new()
        }
    }
}

/// Watch kind `K` in `namespace` (all namespaces if empty)
pub fn watch_kind<K: SyncObject>(client: Client, namespace: &str) -> BoxStream<'static, Observed<K>> {
    let api = KubeObjectClient::<K>::new(client).dynamic_api(namespace);
    watcher::watcher(api, watcher_config())
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(event) => Some(stream::iter(observe::<K>(event))),
                Err(e) => {
                    warn!(kind = %K::kind(&()), error = %e, "Watch error, will retry");
                    None
                }
            }
        })
        .flatten()
        .boxed()
}

// =============================================================================
// Extra watch sources
// =============================================================================

/// Additional request streams of a kind
#[derive(Default)]
pub struct WatchSources {
    streams: Vec<BoxStream<'static, Request>>,
}

impl fmt::Debug for WatchSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSources")
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl WatchSources {
    /// No extra sources
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw request stream
    pub fn add(&mut self, stream: impl Stream<Item = Request> + Send + 'static) {
        self.streams.push(stream.boxed());
    }

    /// Watch a related kind and map each touched object to requests of this kind
    pub fn watch_related<R, F>(&mut self, api: Api<R>, map: F)
    where
        R: Resource + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
        F: Fn(&R) -> Vec<Request> + Send + Sync + 'static,
    {
        let map = Arc::new(map);
        let requests = watcher::watcher(api, watcher_config())
            .default_backoff()
            .touched_objects()
            .filter_map(move |obj| {
                let map = map.clone();
                async move {
                    match obj {
                        Ok(obj) => Some(stream::iter(map(&obj))),
                        Err(e) => {
                            warn!(error = %e, "Related watch error, will retry");
                            None
                        }
                    }
                }
            })
            .flatten();
        self.add(requests);
    }

    /// Number of sources
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True if no source was added
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub(crate) fn into_stream(self) -> BoxStream<'static, Request> {
        stream::select_all(self.streams).boxed()
    }
}

// =============================================================================
// Routing
// =============================================================================

/// Requests for a watch event, empty if the event is not ours
///
/// A delete also enqueues the counterpart on the other cluster.
pub fn route<K: SyncObject>(
    controller: &SyncController<K>,
    side: Side,
    observed: &Observed<K>,
) -> Vec<Request> {
    let obj = observed.object();
    let key = ObjectKey::of(obj);
    let translator = &controller.registration().translator;
    let deleted = matches!(observed, Observed::Deleted(_));
    match side {
        Side::Virtual => {
            let mut requests = vec![Request::Virtual(key.clone())];
            if deleted {
                let host_key = translator.virtual_to_host(&key, Some(obj));
                if !host_key.is_empty() {
                    requests.push(Request::Host(host_key));
                }
            }
            requests
        }
        Side::Host => {
            if controller.exclude_physical(obj) != HostExclusion::Included {
                return Vec::new();
            }
            let mut requests = vec![Request::Host(key)];
            if deleted {
                if let Some(virtual_key) = translator.host_to_virtual_by_annotations(obj) {
                    requests.push(Request::Virtual(virtual_key));
                }
            }
            requests
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Runs the controller of one kind against live clusters
pub struct SyncerRunner<K: SyncObject> {
    controller: Arc<SyncController<K>>,
    virtual_client: Client,
    host_client: Client,
}

impl<K: SyncObject> SyncerRunner<K> {
    /// Runner for a controller
    pub fn new(controller: Arc<SyncController<K>>, virtual_client: Client, host_client: Client) -> Self {
        Self {
            controller,
            virtual_client,
            host_client,
        }
    }

    /// Initialize the kind, then reconcile until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let controller = self.controller;
        controller.initialize().await?;

        let ctx = controller.context();
        let registration = controller.registration();
        let kind = registration.translator.kind().clone();

        let mut sources = WatchSources::new();
        if let Some(modifier) = &registration.modifier {
            modifier.modify_controller(ctx, &mut sources)?;
        }

        let virtual_events = watch_kind::<K>(self.virtual_client, "");
        let host_namespace = if kind.namespaced {
            ctx.config.host_namespace.as_str()
        } else {
            ""
        };
        let host_events = watch_kind::<K>(self.host_client, host_namespace);

        let routed = {
            let for_virtual = controller.clone();
            let for_host = controller.clone();
            let virtual_requests = virtual_events
                .flat_map(move |ev| stream::iter(route(&for_virtual, Side::Virtual, &ev)));
            let host_requests =
                host_events.flat_map(move |ev| stream::iter(route(&for_host, Side::Host, &ev)));
            let mapping_changes = receiver_stream(ctx.store.watch(kind.gvk.clone()).await)
                .map(|mapping| Request::Virtual(mapping.virtual_key));
            stream::select_all([
                virtual_requests.boxed(),
                host_requests.boxed(),
                mapping_changes.boxed(),
                sources.into_stream(),
            ])
        };

        info!(
            syncer = controller.name(),
            kind = %kind,
            workers = ctx.config.max_concurrent_reconciles,
            "Starting syncer"
        );

        let queue = Arc::new(WorkQueue::new());
        let feeder = tokio::spawn(feed(routed, queue.clone(), cancel.clone()));

        let options = WorkerOptions::from_config(controller.name(), &ctx.config);
        let worker_controller = controller.clone();
        run_workers(queue, options, cancel, move |request| {
            let controller = worker_controller.clone();
            async move { controller.reconcile(request).await }
        })
        .await;

        feeder.abort();
        info!(syncer = controller.name(), "Syncer stopped");
        Ok(())
    }
}

fn receiver_stream<T: Send + 'static>(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<T>,
) -> impl Stream<Item = T> + Send {
    stream::poll_fn(move |cx| rx.poll_recv(cx))
}

async fn feed(
    mut requests: impl Stream<Item = Request> + Unpin,
    queue: Arc<WorkQueue<Request>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = requests.next() => match next {
                Some(request) => {
                    debug!(request = %request, "Enqueue");
                    queue.add(request);
                }
                None => break,
            },
        }
    }
}
