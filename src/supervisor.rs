use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Duration, Instant};
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, error, info, warn};

use crate::auth::{Credential, CredentialProvider};
use crate::error::BridgeError;
use crate::live_feed::FeedConnector;
use crate::location::LocationResolver;
use crate::session::{FeedSession, Relay, SessionEnd, SessionState};

/// Top-level control loop.
///
/// Establishes sessions one after another for the lifetime of the process
/// and keeps the current credential fresh. The supervisor is the only writer
/// of the credential slot; running sessions read it.
pub struct Supervisor {
    credentials: Arc<dyn CredentialProvider>,
    locations: Arc<dyn LocationResolver>,
    connector: Arc<dyn FeedConnector>,
    relay: Arc<Relay>,
    reconnect_delay: Duration,
    refresh_interval: Duration,
    current: watch::Sender<Option<Credential>>,
    session_state: Arc<watch::Sender<SessionState>>,
}

impl Supervisor {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        locations: Arc<dyn LocationResolver>,
        connector: Arc<dyn FeedConnector>,
        relay: Arc<Relay>,
        reconnect_delay: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            credentials,
            locations,
            connector,
            relay,
            reconnect_delay,
            refresh_interval,
            current: watch::channel(None).0,
            session_state: Arc::new(watch::channel(SessionState::Unauthenticated).0),
        }
    }

    /// Observe the state of whichever session is current.
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.session_state.subscribe()
    }

    /// Run forever: start the refresh timer, then establish sessions with a
    /// fixed pause between attempts.
    pub async fn run(self: Arc<Self>) {
        tokio::spawn(self.clone().refresh_loop());

        for delay in FixedInterval::new(self.reconnect_delay) {
            match self.establish().await {
                Ok(SessionEnd::Disconnected(reason)) => {
                    warn!(%reason, "Live data session ended, attempting reconnect");
                }
                Ok(SessionEnd::Unauthorized(reason)) => {
                    error!(%reason, "Live data channel refused the token");
                }
                Err(e) => error!(error = %e, "Error during the setup"),
            }

            info!(delay_secs = delay.as_secs(), "Re-establishing session after delay");
            sleep(delay).await;
        }
    }

    /// One full session: fresh credential, fresh location, fresh channel.
    pub async fn establish(&self) -> Result<SessionEnd, BridgeError> {
        let credential = self.credentials.fetch_access_token().await?;
        self.current.send_replace(Some(credential.clone()));
        // Taken before any await: a refresh during setup must still reach the session.
        let updates = self.current.subscribe();

        let location = self.locations.resolve_location(&credential).await?;
        let channel = self.connector.open(&credential).await?;

        let session = FeedSession::new(
            credential,
            location,
            channel.commands,
            self.relay.clone(),
            self.session_state.clone(),
        );
        Ok(session.run(channel.events, updates).await)
    }

    /// Fetch a credential and publish it if it differs from the held one.
    /// Returns whether it changed.
    pub async fn refresh_credential(&self) -> Result<bool, BridgeError> {
        let fresh = self.credentials.fetch_access_token().await?;
        Ok(self.current.send_if_modified(|slot| {
            if slot.as_ref() == Some(&fresh) {
                false
            } else {
                *slot = Some(fresh);
                true
            }
        }))
    }

    async fn refresh_loop(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        loop {
            ticker.tick().await;
            match self.refresh_credential().await {
                Ok(true) => info!("Access token has changed"),
                Ok(false) => debug!("Access token unchanged"),
                Err(e) => error!(error = %e, "Error refreshing token"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_feed::{ClientEvent, FeedChannel, ServerEvent};
    use crate::models::LocationId;
    use crate::mqtt_service::tests::RecordingPublisher;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const DELAY: Duration = Duration::from_secs(5);
    const REFRESH: Duration = Duration::from_secs(12 * 60 * 60);

    /// Issues `token-1`, `token-2`, ... unless told to repeat or fail.
    #[derive(Default)]
    struct FakeTokens {
        calls: AtomicUsize,
        fixed: Mutex<Option<Result<String, String>>>,
    }

    impl FakeTokens {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn answer_with(&self, answer: Result<&str, &str>) {
            *self.fixed.lock().unwrap() = Some(answer.map(str::to_string).map_err(str::to_string));
        }
    }

    #[async_trait]
    impl CredentialProvider for FakeTokens {
        async fn fetch_access_token(&self) -> Result<Credential, BridgeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fixed.lock().unwrap().clone() {
                Some(Ok(token)) => Ok(Credential::new(token)),
                Some(Err(reason)) => Err(BridgeError::Auth(reason)),
                None => Ok(Credential::new(format!("token-{n}"))),
            }
        }
    }

    #[derive(Default)]
    struct FakeLocations {
        seen: Mutex<Vec<Credential>>,
    }

    impl FakeLocations {
        fn seen(&self) -> Vec<Credential> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LocationResolver for FakeLocations {
        async fn resolve_location(&self, credential: &Credential) -> Result<LocationId, BridgeError> {
            self.seen.lock().unwrap().push(credential.clone());
            Ok(LocationId::new("loc-1"))
        }
    }

    /// Far end of a channel opened by the supervisor.
    struct Remote {
        token: Credential,
        sent: mpsc::UnboundedReceiver<ClientEvent>,
        events: mpsc::Sender<ServerEvent>,
    }

    struct FakeConnector {
        opened: mpsc::UnboundedSender<Remote>,
        open_delay: Duration,
    }

    #[async_trait]
    impl FeedConnector for FakeConnector {
        async fn open(&self, credential: &Credential) -> Result<FeedChannel, BridgeError> {
            if !self.open_delay.is_zero() {
                sleep(self.open_delay).await;
            }
            let (commands, sent) = mpsc::unbounded_channel();
            let (events, event_rx) = mpsc::channel(16);
            let _ = self.opened.send(Remote {
                token: credential.clone(),
                sent,
                events,
            });
            Ok(FeedChannel {
                commands,
                events: event_rx,
            })
        }
    }

    struct Fixture {
        supervisor: Arc<Supervisor>,
        tokens: Arc<FakeTokens>,
        locations: Arc<FakeLocations>,
        opened: mpsc::UnboundedReceiver<Remote>,
    }

    fn fixture() -> Fixture {
        fixture_with_open_delay(Duration::ZERO)
    }

    fn fixture_with_open_delay(open_delay: Duration) -> Fixture {
        let tokens = Arc::new(FakeTokens::default());
        let locations = Arc::new(FakeLocations::default());
        let (opened_tx, opened) = mpsc::unbounded_channel();
        let relay = Arc::new(Relay::new("home/curb", Arc::new(RecordingPublisher::default())));
        let supervisor = Arc::new(Supervisor::new(
            tokens.clone(),
            locations.clone(),
            Arc::new(FakeConnector {
                opened: opened_tx,
                open_delay,
            }),
            relay,
            DELAY,
            REFRESH,
        ));
        Fixture {
            supervisor,
            tokens,
            locations,
            opened,
        }
    }

    async fn subscribe(remote: &mut Remote) {
        remote.events.send(ServerEvent::Connected).await.unwrap();
        assert!(matches!(remote.sent.recv().await, Some(ClientEvent::Authenticate(_))));
        remote.events.send(ServerEvent::Authorized).await.unwrap();
        assert!(matches!(remote.sent.recv().await, Some(ClientEvent::Subscribe(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_restarts_once_after_fixed_delay_with_fresh_setup() {
        let mut f = fixture();
        tokio::spawn(f.supervisor.clone().run());

        let mut first = f.opened.recv().await.unwrap();
        assert_eq!(first.token, Credential::new("token-1"));
        subscribe(&mut first).await;

        first
            .events
            .send(ServerEvent::Disconnected("transport close".into()))
            .await
            .unwrap();

        sleep(DELAY - Duration::from_millis(100)).await;
        assert!(f.opened.try_recv().is_err());
        assert_eq!(f.tokens.calls(), 1);
        assert_eq!(*f.supervisor.session_state().borrow(), SessionState::Disconnected);

        sleep(Duration::from_millis(200)).await;
        let second = f.opened.recv().await.unwrap();
        assert_eq!(second.token, Credential::new("token-2"));
        assert_eq!(f.tokens.calls(), 2);
        assert_eq!(
            f.locations.seen(),
            vec![Credential::new("token-1"), Credential::new("token-2")]
        );
        assert!(f.opened.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_token_reauthenticates_in_place() {
        let mut f = fixture();
        tokio::spawn(f.supervisor.clone().run());

        let mut remote = f.opened.recv().await.unwrap();
        subscribe(&mut remote).await;

        sleep(REFRESH + Duration::from_secs(1)).await;

        assert_eq!(
            remote.sent.recv().await,
            Some(ClientEvent::Authenticate(Credential::new("token-2")))
        );
        remote.events.send(ServerEvent::Authorized).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(remote.sent.try_recv().is_err());
        assert!(f.opened.try_recv().is_err());
        assert_eq!(*f.supervisor.session_state().borrow(), SessionState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn token_refreshed_while_connecting_is_used_for_the_handshake() {
        let mut f = fixture_with_open_delay(Duration::from_secs(1));
        let supervisor = f.supervisor.clone();
        tokio::spawn(async move { supervisor.establish().await });

        sleep(Duration::from_millis(500)).await;
        assert!(f.supervisor.refresh_credential().await.unwrap());

        let mut remote = f.opened.recv().await.unwrap();
        assert_eq!(remote.token, Credential::new("token-1"));
        sleep(Duration::from_millis(10)).await;

        remote.events.send(ServerEvent::Connected).await.unwrap();
        assert_eq!(
            remote.sent.recv().await,
            Some(ClientEvent::Authenticate(Credential::new("token-2")))
        );
        sleep(Duration::from_millis(10)).await;
        assert!(remote.sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_token_is_not_pushed() {
        let mut f = fixture();
        f.tokens.answer_with(Ok("same"));
        tokio::spawn(f.supervisor.clone().run());

        let mut remote = f.opened.recv().await.unwrap();
        subscribe(&mut remote).await;

        sleep(REFRESH + Duration::from_secs(1)).await;
        assert_eq!(f.tokens.calls(), 2);
        assert!(remote.sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_leaves_session_running() {
        let mut f = fixture();
        tokio::spawn(f.supervisor.clone().run());

        let mut remote = f.opened.recv().await.unwrap();
        subscribe(&mut remote).await;

        f.tokens.answer_with(Err("HTTP 500"));
        sleep(REFRESH + Duration::from_secs(1)).await;

        assert_eq!(f.tokens.calls(), 2);
        assert!(remote.sent.try_recv().is_err());
        assert!(f.opened.try_recv().is_err());
        assert_eq!(*f.supervisor.session_state().borrow(), SessionState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_auth_failure_skips_location_and_retries_after_delay() {
        let mut f = fixture();
        f.tokens.answer_with(Err("HTTP 401"));

        let err = f.supervisor.establish().await.unwrap_err();
        assert!(err.is_auth());
        assert!(f.locations.seen().is_empty());
        assert!(f.opened.try_recv().is_err());

        tokio::spawn(f.supervisor.clone().run());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(f.tokens.calls(), 2);

        sleep(DELAY).await;
        assert_eq!(f.tokens.calls(), 3);
        assert!(f.locations.seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_session_is_reestablished() {
        let mut f = fixture();
        tokio::spawn(f.supervisor.clone().run());

        let mut first = f.opened.recv().await.unwrap();
        first.events.send(ServerEvent::Connected).await.unwrap();
        first
            .events
            .send(ServerEvent::Unauthorized("jwt malformed".into()))
            .await
            .unwrap();

        sleep(DELAY + Duration::from_millis(100)).await;
        let second = f.opened.recv().await.unwrap();
        assert_eq!(second.token, Credential::new("token-2"));
    }
}
