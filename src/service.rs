//! The orchestrator.
//!
//! [`DatabaseService`] decides which stores exist at any time.  It follows the
//! authenticated user and the network state, builds the user's local store, builds and
//! authenticates the remote store while it is needed, keeps replication between the two
//! running and exposes the store the application should use.
//!
//! All decisions are made by a single actor task.  Inputs arrive as stream items and inbox
//! messages, slow work (building and authenticating the remote store, checking a session)
//! runs in tasks that report back through an internal channel.  Results of work that was
//! superseded in the meantime are recognized by a generation counter and discarded.

use std::{pin::Pin, time::Duration};

use backon::{BackoffBuilder, ConstantBuilder};
use n0_future::{
    Stream, StreamExt,
    task::{self, AbortOnDropHandle},
    time,
};
use n0_watcher::{Direct, Watchable, Watcher};
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error_span, info, trace, warn};

use crate::{
    auth::{AuthenticatedUser, Profile},
    database::Database,
    helper::DatabaseHelper,
    network::NetworkState,
    sync_state::SyncState,
};

const INBOX_CAP: usize = 32;

type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Keeps the stores of the authenticated user and their replication.
#[derive(Debug)]
pub struct DatabaseService {
    outputs: Outputs,
    inbox: mpsc::Sender<Message>,
    _actor: AbortOnDropHandle<()>,
}

/// Values published by the actor.
#[derive(Debug, Clone, Default)]
struct Outputs {
    current: Watchable<Option<Database>>,
    local: Watchable<Option<Database>>,
    remote: Watchable<Option<Database>>,
    sync_state: Watchable<SyncState>,
    profile: Watchable<Option<Profile>>,
}

#[derive(derive_more::Debug)]
enum Message {
    ForceRecreate,
    AppResumed,
    Shutdown {
        #[debug(skip)]
        reply: oneshot::Sender<()>,
    },
}

/// Results of background work.
#[derive(Debug)]
enum Internal {
    RemoteBuilt {
        generation: u64,
        remote: Option<(Database, Option<Profile>)>,
    },
    SessionChecked {
        generation: u64,
        valid: bool,
    },
}

impl DatabaseService {
    /// Starts the orchestrator.
    ///
    /// `users` emits the authenticated user, or `None` after logout.  `network` emits the
    /// network state, see [`network_states`].
    ///
    /// [`network_states`]: crate::network::network_states
    pub fn spawn(
        helper: DatabaseHelper,
        users: impl Stream<Item = Option<AuthenticatedUser>> + Send + 'static,
        network: impl Stream<Item = NetworkState> + Send + 'static,
    ) -> Self {
        let outputs = Outputs::default();
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAP);
        let (internal_tx, internal) = mpsc::channel(INBOX_CAP);
        let actor = Actor {
            helper,
            outputs: outputs.clone(),
            inbox,
            internal,
            internal_tx,
            user: None,
            network: NetworkState::Offline,
            force_requested: false,
            local: None,
            remote: None,
            generation: 0,
            build: None,
            session_check: None,
            sync_forward: None,
        };
        let task = task::spawn(
            actor
                .run(Box::pin(users), Box::pin(network))
                .instrument(error_span!("database-service")),
        );
        Self {
            outputs,
            inbox: inbox_tx,
            _actor: AbortOnDropHandle::new(task),
        }
    }

    /// Watches the store the application should use.
    ///
    /// This is the local store, or the remote store in remote-only deployments.  `None`
    /// while no user is logged in or the store is not built yet.
    pub fn current_store(&self) -> Direct<Option<Database>> {
        self.outputs.current.watch()
    }

    /// The store the application should use right now.
    pub fn current(&self) -> Option<Database> {
        self.outputs.current.get()
    }

    /// Watches the local store.
    pub fn local_store(&self) -> Direct<Option<Database>> {
        self.outputs.local.watch()
    }

    /// Watches the authenticated remote store.
    pub fn remote_store(&self) -> Direct<Option<Database>> {
        self.outputs.remote.watch()
    }

    /// Watches the state of replication between the local and the remote store.
    pub fn sync_state(&self) -> Direct<SyncState> {
        self.outputs.sync_state.watch()
    }

    /// Watches the profile of the user, refreshed on every remote login.
    pub fn profile(&self) -> Direct<Option<Profile>> {
        self.outputs.profile.watch()
    }

    /// Checks the remote session and rebuilds the remote store if the session is gone.
    ///
    /// Without a remote store, one is built even while the network is reported down.
    pub async fn force_recreate_remote_if_necessary(&self) {
        self.inbox.send(Message::ForceRecreate).await.ok();
    }

    /// Signals that the application returned to the foreground.
    pub async fn app_resumed(&self) {
        self.inbox.send(Message::AppResumed).await.ok();
    }

    /// Closes all stores and stops the orchestrator.
    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.inbox.send(Message::Shutdown { reply }).await.is_ok() {
            done.await.ok();
        }
    }
}

struct Actor {
    helper: DatabaseHelper,
    outputs: Outputs,
    inbox: mpsc::Receiver<Message>,
    internal: mpsc::Receiver<Internal>,
    internal_tx: mpsc::Sender<Internal>,
    user: Option<AuthenticatedUser>,
    network: NetworkState,
    force_requested: bool,
    local: Option<Database>,
    remote: Option<Database>,
    /// Bumped whenever the remote store is torn down or rebuilt.
    generation: u64,
    build: Option<AbortOnDropHandle<()>>,
    session_check: Option<AbortOnDropHandle<()>>,
    sync_forward: Option<AbortOnDropHandle<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut users: BoxedStream<Option<AuthenticatedUser>>,
        mut network: BoxedStream<NetworkState>,
    ) {
        let mut users_done = false;
        let mut network_done = false;
        loop {
            tokio::select! {
                biased;
                msg = self.inbox.recv() => match msg {
                    None => break,
                    Some(Message::Shutdown { reply }) => {
                        self.teardown();
                        reply.send(()).ok();
                        break;
                    }
                    Some(Message::ForceRecreate) => {
                        debug!("remote recreation requested");
                        self.force_requested = true;
                        self.check_session();
                    }
                    Some(Message::AppResumed) => {
                        trace!("app resumed");
                        self.check_session();
                    }
                },
                Some(internal) = self.internal.recv() => self.on_internal(internal),
                user = users.next(), if !users_done => match user {
                    Some(user) => self.on_user(user).await,
                    None => users_done = true,
                },
                state = network.next(), if !network_done => match state {
                    Some(state) => self.on_network(state),
                    None => network_done = true,
                },
            }
        }
        debug!("stopped");
    }

    async fn on_user(&mut self, user: Option<AuthenticatedUser>) {
        let same_user = match (&self.user, &user) {
            (Some(a), Some(b)) => {
                a.username() == b.username() && a.profile.database == b.profile.database
            }
            (None, None) => true,
            _ => false,
        };
        if same_user {
            // keep the stores, but use the latest credentials for the next login
            self.user = user;
            return;
        }
        debug!(user = ?user.as_ref().map(|u| u.username()), "user changed");
        self.teardown_remote();
        if let Some(local) = self.local.take() {
            local.close();
        }
        self.outputs
            .profile
            .set(user.as_ref().map(|u| u.profile.clone()))
            .ok();
        self.user = user;

        if let Some(user) = &self.user {
            if !self.helper.config().remote_only {
                let name = self.helper.local_name(&user.profile);
                match self.helper.local(&name).await {
                    Ok(local) => self.local = Some(local),
                    Err(err) => warn!(%name, "failed to open local store: {err:#}"),
                }
            }
        }
        self.follow_sync_state();
        self.reconcile_remote(false);
        self.maintain_replication();
        self.publish();
    }

    fn on_network(&mut self, state: NetworkState) {
        if state == self.network {
            return;
        }
        debug!(%state, "network changed");
        self.network = state;
        if !state.is_up() {
            self.teardown_remote();
        }
        self.reconcile_remote(state == NetworkState::Reconnected);
        self.publish();
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::RemoteBuilt { generation, remote } => {
                if generation != self.generation {
                    trace!(generation, "discarding superseded remote store");
                    if let Some((remote, _)) = remote {
                        remote.close();
                    }
                    return;
                }
                self.build = None;
                self.force_requested = false;
                match remote {
                    Some((remote, profile)) => {
                        info!(name = %remote.name(), "remote store ready");
                        if let Some(profile) = profile {
                            self.outputs.profile.set(Some(profile)).ok();
                        }
                        self.remote = Some(remote);
                    }
                    None => debug!("no remote store available"),
                }
                self.maintain_replication();
                self.publish();
            }
            Internal::SessionChecked { generation, valid } => {
                if generation != self.generation {
                    return;
                }
                if valid {
                    trace!("remote session valid");
                    self.force_requested = false;
                    return;
                }
                debug!("remote session gone, recreating remote store");
                // a pending force outlives the store it recreates
                let forced = self.force_requested;
                self.teardown_remote();
                self.force_requested = forced;
                self.reconcile_remote(false);
                self.publish();
            }
        }
    }

    /// Whether a remote store should exist.
    fn remote_needed(&self) -> bool {
        self.user.is_some() && (self.network.is_up() || self.force_requested)
    }

    /// Starts building the remote store if needed, tears it down otherwise.
    fn reconcile_remote(&mut self, reconnected: bool) {
        if !self.remote_needed() {
            if self.remote.is_some() || self.build.is_some() {
                self.teardown_remote();
            }
            return;
        }
        if self.remote.is_some() || self.build.is_some() {
            return;
        }
        let Some(user) = self.user.clone() else {
            return;
        };
        let config = self.helper.config();
        let delay = if reconnected {
            config.reconnect_delay()
        } else {
            Duration::ZERO
        };
        let attempts = config.auth_retry_attempts;
        let retry_delay = config.auth_retry_delay();
        self.generation += 1;
        let generation = self.generation;
        let helper = self.helper.clone();
        let tx = self.internal_tx.clone();
        debug!(generation, ?delay, "building remote store");
        let task = task::spawn(
            async move {
                if !delay.is_zero() {
                    time::sleep(delay).await;
                }
                let remote = build_remote(&helper, &user, attempts, retry_delay).await;
                tx.send(Internal::RemoteBuilt { generation, remote })
                    .await
                    .ok();
            }
            .instrument(error_span!("remote", generation)),
        );
        self.build = Some(AbortOnDropHandle::new(task));
    }

    /// Checks the session of the remote store, or builds one if there is none.
    fn check_session(&mut self) {
        let Some(remote) = self.remote.clone() else {
            self.reconcile_remote(false);
            return;
        };
        let generation = self.generation;
        let tx = self.internal_tx.clone();
        let task = task::spawn(
            async move {
                let valid = match remote.session().await {
                    Ok(session) => session.is_some(),
                    Err(err) => {
                        debug!("session check failed: {err:#}");
                        false
                    }
                };
                tx.send(Internal::SessionChecked { generation, valid })
                    .await
                    .ok();
            }
            .instrument(error_span!("session-check", generation)),
        );
        self.session_check = Some(AbortOnDropHandle::new(task));
    }

    fn teardown_remote(&mut self) {
        self.generation += 1;
        self.force_requested = false;
        self.build = None;
        self.session_check = None;
        if let Some(remote) = self.remote.take() {
            debug!(name = %remote.name(), "tearing down remote store");
            remote.close();
            self.maintain_replication();
        }
    }

    /// Restarts replication for the current pair of stores.
    fn maintain_replication(&mut self) {
        let Some(local) = &self.local else {
            return;
        };
        local.cancel_replication();
        if let Some(remote) = &self.remote {
            if let Err(err) = local.replicate_with(remote) {
                warn!("failed to start replication: {err:#}");
            }
        }
    }

    /// Forwards the sync state of the current local store.
    fn follow_sync_state(&mut self) {
        let Some(local) = &self.local else {
            self.sync_forward = None;
            self.outputs.sync_state.set(SyncState::default()).ok();
            return;
        };
        let mut states = local.sync_state().stream();
        let out = self.outputs.sync_state.clone();
        let task = task::spawn(async move {
            while let Some(state) = states.next().await {
                out.set(state).ok();
            }
        });
        self.sync_forward = Some(AbortOnDropHandle::new(task));
    }

    fn publish(&self) {
        let current = if self.helper.config().remote_only {
            self.remote.clone()
        } else {
            self.local.clone()
        };
        self.outputs.local.set(self.local.clone()).ok();
        self.outputs.remote.set(self.remote.clone()).ok();
        self.outputs.current.set(current).ok();
    }

    fn teardown(&mut self) {
        self.teardown_remote();
        if let Some(local) = self.local.take() {
            local.close();
        }
        self.follow_sync_state();
        self.publish();
    }
}

/// Builds the remote store and logs in, retrying failed attempts with a fixed delay.
async fn build_remote(
    helper: &DatabaseHelper,
    user: &AuthenticatedUser,
    attempts: usize,
    retry_delay: Duration,
) -> Option<(Database, Option<Profile>)> {
    let name = &user.profile.database;
    let remote = match helper.remote(name).await {
        Ok(remote) => remote,
        Err(err) => {
            warn!(%name, "failed to open remote store: {err:#}");
            return None;
        }
    };
    let mut backoff = ConstantBuilder::default()
        .with_delay(retry_delay)
        .with_max_times(attempts.saturating_sub(1))
        .build();
    let credentials = &user.credentials;
    let mut attempt = 1;
    loop {
        match remote
            .authenticate(&credentials.username, &credentials.password)
            .await
        {
            Ok(true) => break,
            Ok(false) => {
                warn!(username = %credentials.username, "remote rejected the credentials");
                remote.close();
                return None;
            }
            Err(err) => {
                let Some(delay) = backoff.next() else {
                    warn!(attempt, "giving up remote authentication: {err:#}");
                    remote.close();
                    return None;
                };
                debug!(attempt, "remote authentication failed, retry in {delay:?}: {err:#}");
                attempt += 1;
                time::sleep(delay).await;
            }
        }
    }
    let profile = match remote.get_user(&credentials.username).await {
        Ok(doc) => Some(doc.profile(name.clone())),
        Err(err) => {
            debug!("keeping cached profile: {err:#}");
            None
        }
    };
    Some((remote, profile))
}
