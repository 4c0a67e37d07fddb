//! Request registry
//!
//! The [`RequestManager`] owns every live request, keyed by id in
//! registration order. All state transitions go through it so that a
//! completed request is deregistered in the same step that sends its reply.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::consent::{ConsentEvent, ConsentGate, ConsentPrompt, ConsentState, ConsentSurface, Decision};
use crate::error::{BrokerError, ErrorKind};
use crate::idle::ActivityReporter;
use crate::params::{self, Parameters, ParametersExt, KEY_APPLICATION_ID, KEY_PROVIDER};
use crate::request::{Caller, Interface, Outcome, Reply, ReplySink, Request, RequestId, RequestKind};
use crate::trust::TrustResolver;
use crate::window::{WindowError, WindowHandle, WindowRouter};

/// Label used in the consent summary when the caller is unknown
pub const DEFAULT_APPLICATION_LABEL: &str = "Ubuntu";

/// What `enqueue` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Registered and started
    Started(RequestId),
    /// Dropped in favour of an equivalent live request
    Duplicate(RequestId),
}

/// Live request as reported to the dialog renderer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub id: RequestId,
    pub kind: RequestKind,
    pub interface: Interface,
    pub connection: String,
    pub profile: String,
    pub parameters: Parameters,
    pub created_at: DateTime<Utc>,
    pub window: Option<WindowHandle>,
    pub consent: Option<ConsentState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    /// Provider whose account the request is about, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}


pub struct RequestManager {
    requests: BTreeMap<RequestId, Request>,
    next_id: u64,
    trust: Arc<TrustResolver>,
    catalog: Arc<dyn Catalog>,
    router: WindowRouter,
    surface: Arc<dyn ConsentSurface>,
    default_application_label: String,
    registry_activity: ActivityReporter,
    consent_activity: ActivityReporter,
}

impl RequestManager {
    pub fn new(
        trust: Arc<TrustResolver>,
        catalog: Arc<dyn Catalog>,
        router: WindowRouter,
        surface: Arc<dyn ConsentSurface>,
    ) -> Self {
        Self {
            requests: BTreeMap::new(),
            next_id: 1,
            trust,
            catalog,
            router,
            surface,
            default_application_label: DEFAULT_APPLICATION_LABEL.to_string(),
            registry_activity: ActivityReporter::detached("requests"),
            consent_activity: ActivityReporter::detached("consent"),
        }
    }

    pub fn with_default_application_label(mut self, label: impl Into<String>) -> Self {
        self.default_application_label = label.into();
        self
    }

    /// Report registry and consent activity to the idle supervisor
    pub fn with_activity(mut self, registry: ActivityReporter, consent: ActivityReporter) -> Self {
        self.registry_activity = registry;
        self.consent_activity = consent;
        self
    }

    /// Build a request for a call on `interface`.
    ///
    /// Malformed parameters are answered with `InvalidParameters` right
    /// away and no request is created.
    pub fn construct(
        &mut self,
        interface: Interface,
        caller: Caller,
        parameters: Parameters,
        reply: ReplySink,
    ) -> Result<Request, BrokerError> {
        let kind = match RequestKind::classify(interface, &parameters) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(interface = interface.as_str(), caller = %caller.connection, error = %e, "Rejecting request");
                reply.send(Reply::error(e.kind(), e.to_string()));
                return Err(e);
            }
        };

        let id = RequestId(self.next_id);
        self.next_id += 1;
        debug!(request = %id, %kind, profile = %caller.profile, "Request created");
        Ok(Request::new(id, kind, parameters, caller, reply))
    }

    /// Register and start `request`, unless an equivalent one is live
    pub fn enqueue(&mut self, request: Request) -> Enqueued {
        if let Some(existing) = self.equivalent(&request) {
            info!(request = %request.id(), %existing, "Equivalent request in progress, dropping duplicate");
            request.acknowledge();
            return Enqueued::Duplicate(existing);
        }

        let id = request.id();
        let mut request = request;
        request.start();
        let claimed = match request.interface() {
            Interface::Accounts => request
                .parameters()
                .str_value(KEY_APPLICATION_ID)
                .map(str::to_string),
            Interface::SignOn => None,
        };
        self.requests.insert(id, request);
        self.update_activity();

        if let Some(claimed) = claimed {
            self.verify_application(id, &claimed);
        }
        Enqueued::Started(id)
    }

    fn verify_application(&mut self, id: RequestId, claimed: &str) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };

        match self.trust.application_info(claimed, request.caller_profile()) {
            Some(info) => {
                debug!(request = %id, application = %info.id, "Application verified");
                request.set_application(info);
            }
            None => {
                warn!(request = %id, claimed, profile = %request.caller_profile(), "Application doesn't match caller profile");
                let message = format!("Application '{}' doesn't match the caller", claimed);
                let _ = self.fail(id, ErrorKind::Forbidden, message);
            }
        }
    }

    /// Live request that `request` would duplicate.
    ///
    /// Equivalence holds both ways: a live request matching the dedup key of
    /// `request`, or a single-flight live request whose dedup key `request`
    /// matches. Either way the pair would make `find` ambiguous.
    fn equivalent(&self, request: &Request) -> Option<RequestId> {
        if request.allow_multiple() {
            return None;
        }
        let key = request.dedup_key();
        if !key.is_empty() {
            if let Some(existing) = self.find(&key) {
                return Some(existing.id());
            }
        }

        self.requests
            .values()
            .filter(|live| !live.allow_multiple())
            .find(|live| {
                let live_key = live.dedup_key();
                !live_key.is_empty() && params::is_superset(request.parameters(), &live_key)
            })
            .map(Request::id)
    }

    /// First live request, in registration order, whose parameters are a
    /// superset of `pattern`
    pub fn find(&self, pattern: &Parameters) -> Option<&Request> {
        self.requests
            .values()
            .find(|request| params::is_superset(request.parameters(), pattern))
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RequestSummary> {
        self.requests.values().map(|request| self.summarize(request)).collect()
    }

    fn summarize(&self, request: &Request) -> RequestSummary {
        RequestSummary {
            id: request.id(),
            kind: request.kind(),
            interface: request.interface(),
            connection: request.caller().connection.clone(),
            profile: request.caller_profile().to_string(),
            parameters: request.parameters().clone(),
            created_at: request.created_at(),
            window: request.window(),
            consent: request.consent().map(ConsentGate::state),
            application_id: request.application().map(|app| app.id.clone()),
            provider: self.provider_for(request),
        }
    }

    /// Provider of the account a request is about. Sign-on requests name an
    /// identity; when no account holds it the credential store may still
    /// have named the provider in `clientData`.
    fn provider_for(&self, request: &Request) -> Option<String> {
        match request.interface() {
            Interface::Accounts => request
                .parameters()
                .str_value(KEY_PROVIDER)
                .map(str::to_string),
            Interface::SignOn => request
                .consent()
                .map(|gate| gate.account().provider.clone())
                .or_else(|| {
                    self.catalog
                        .account_for_credentials(request.identity())
                        .map(|account| account.provider)
                })
                .or_else(|| request.client_provider().map(str::to_string)),
        }
    }

    /// Answer request `id` with `result`.
    ///
    /// Requests behind a consent gate can only succeed once the user has
    /// granted access; until then they stay live and may still fail or be
    /// canceled.
    pub fn succeed(&mut self, id: RequestId, result: Parameters) -> Result<Outcome, BrokerError> {
        let request = self.requests.get(&id).ok_or(BrokerError::UnknownRequest(id))?;
        if request.kind().requires_consent()
            && request.consent().map(ConsentGate::state) != Some(ConsentState::Granted)
        {
            warn!(request = %id, "Refusing to complete a request without consent");
            return Err(BrokerError::ConsentRequired(id));
        }
        self.finish(id, |request| request.succeed(result))
    }

    pub fn fail(
        &mut self,
        id: RequestId,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<Outcome, BrokerError> {
        let message = message.into();
        self.finish(id, |request| request.fail(kind, message))
    }

    pub fn cancel(&mut self, id: RequestId) -> Result<Outcome, BrokerError> {
        self.finish(id, Request::cancel)
    }

    /// Cancel the first live request issued on `connection` that matches
    /// `pattern`. Requests of other connections are never touched.
    pub fn cancel_matching(&mut self, connection: &str, pattern: &Parameters) -> Option<RequestId> {
        let id = self
            .requests
            .values()
            .filter(|request| request.caller().connection == connection)
            .find(|request| params::is_superset(request.parameters(), pattern))?
            .id();
        self.cancel(id).ok().map(|_| id)
    }

    /// Cancel everything issued on a connection that went away
    pub fn cancel_for_connection(&mut self, connection: &str) -> usize {
        let ids: Vec<RequestId> = self
            .requests
            .values()
            .filter(|request| request.caller().connection == connection)
            .map(Request::id)
            .collect();
        if !ids.is_empty() {
            info!(connection, count = ids.len(), "Caller disconnected, canceling its requests");
        }
        ids.into_iter().filter(|id| self.cancel(*id).is_ok()).count()
    }

    pub fn cancel_all(&mut self) -> usize {
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        ids.into_iter().filter(|id| self.cancel(*id).is_ok()).count()
    }

    fn finish(
        &mut self,
        id: RequestId,
        complete: impl FnOnce(&mut Request) -> Option<Outcome>,
    ) -> Result<Outcome, BrokerError> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(BrokerError::UnknownRequest(id))?;
        let consent_pending = request.consent_pending();

        // Registered requests are always in progress
        let outcome = complete(request).ok_or(BrokerError::UnknownRequest(id))?;

        if consent_pending {
            self.surface.close(id);
        }
        self.requests.remove(&id);
        self.update_activity();
        Ok(outcome)
    }

    /// The renderer has a window ready for request `id`.
    ///
    /// Requests that need consent get their window held back behind a
    /// consent prompt; the first presentation opens it, later ones while it
    /// is pending are ignored.
    pub fn present(&mut self, id: RequestId, window: WindowHandle) -> Result<(), BrokerError> {
        let request = self.requests.get(&id).ok_or(BrokerError::UnknownRequest(id))?;

        if !request.kind().requires_consent() {
            return self.route(id, window);
        }

        match request.consent().map(ConsentGate::state) {
            Some(ConsentState::Pending) => {
                debug!(request = %id, %window, "Consent pending, ignoring window");
                return Ok(());
            }
            Some(ConsentState::Granted) => return self.route(id, window),
            Some(ConsentState::Denied) => return Ok(()),
            None => {}
        }

        let identity = request.identity();
        let application = self.application_label(request.caller_profile());

        let Some(account) = self.catalog.account_for_credentials(identity) else {
            warn!(request = %id, identity, "No account for credentials");
            let message = format!("No account found for identity {}", identity);
            self.fail(id, ErrorKind::Forbidden, message.clone())?;
            return Err(BrokerError::Forbidden(message));
        };

        let provider = self
            .catalog
            .provider(&account.provider)
            .map(|p| p.display_name)
            .unwrap_or_else(|| account.provider.clone());
        let prompt = ConsentPrompt::new(&application, &provider, &account.display_name);

        if let Err(e) = self.surface.show(id, &prompt) {
            warn!(request = %id, error = %e, "Couldn't show consent prompt");
            let message = e.to_string();
            self.fail(id, ErrorKind::Forbidden, message.clone())?;
            return Err(BrokerError::Forbidden(message));
        }

        if let Some(request) = self.requests.get_mut(&id) {
            debug!(request = %id, account = account.id, %window, "Waiting for consent");
            request.open_consent(ConsentGate::open(account, window));
        }
        self.update_activity();
        Ok(())
    }

    /// Apply a user decision taken on the consent surface
    pub fn on_consent_event(&mut self, event: ConsentEvent) -> Option<Decision> {
        let id = match &event {
            ConsentEvent::Action { request, .. } | ConsentEvent::Closed { request } => *request,
        };
        let Some(gate) = self.requests.get_mut(&id).and_then(Request::consent_mut) else {
            debug!(request = %id, "Consent event for a finished request");
            return None;
        };

        let decision = match &event {
            ConsentEvent::Action { action, .. } => gate.on_action(action),
            ConsentEvent::Closed { .. } => gate.on_closed(),
        }?;
        debug!(request = %id, ?decision, "Consent decided");

        match decision {
            Decision::Granted(window) => {
                self.update_activity();
                if let Err(e) = self.route(id, window) {
                    debug!(request = %id, error = %e, "Granted window not shown");
                }
            }
            Decision::Denied => {
                let _ = self.fail(id, ErrorKind::Forbidden, "Access denied by the user");
            }
        }
        Some(decision)
    }

    fn route(&mut self, id: RequestId, window: WindowHandle) -> Result<(), BrokerError> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(BrokerError::UnknownRequest(id))?;

        match self.router.show(request, window) {
            Ok(()) => Ok(()),
            Err(WindowError::Host(message)) => {
                self.fail(id, ErrorKind::Forbidden, message.clone())?;
                Err(BrokerError::Forbidden(message))
            }
            // Already logged by the router
            Err(_) => Ok(()),
        }
    }

    fn application_label(&self, profile: &str) -> String {
        if profile.is_empty() {
            return self.default_application_label.clone();
        }
        self.trust
            .application_for_profile(profile)
            .map(|app| app.display_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.default_application_label.clone())
    }

    fn update_activity(&self) {
        self.registry_activity.set_busy(!self.requests.is_empty());
        self.consent_activity
            .set_busy(self.requests.values().any(Request::consent_pending));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Account, Application, FileCatalog, Provider};
    use crate::consent::{SurfaceError, ACTION_CANCEL, ACTION_CONTINUE};
    use crate::trust::{LookupError, ProcessProfileLookup, SecurityContextLookup};
    use crate::window::{NativeWindowId, WindowHost};
    use authbroker_core::process::ConfinementError;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::oneshot;
    use tokio::sync::oneshot::error::TryRecvError;

    struct NoBus;

    impl SecurityContextLookup for NoBus {
        fn connection_security_context(&self, unique_name: &str) -> Result<String, LookupError> {
            Err(LookupError::NoSuchConnection(unique_name.to_string()))
        }
    }

    struct NoProcesses;

    impl ProcessProfileLookup for NoProcesses {
        fn profile_for_pid(&self, pid: u32) -> Result<String, ConfinementError> {
            Err(ConfinementError::NoSuchProcess(pid))
        }
    }

    #[derive(Default)]
    struct RecordingHost(Mutex<Vec<(WindowHandle, Option<NativeWindowId>)>>);

    impl WindowHost for RecordingHost {
        fn show(
            &self,
            window: WindowHandle,
            transient_parent: Option<NativeWindowId>,
        ) -> Result<(), WindowError> {
            self.0.lock().unwrap().push((window, transient_parent));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSurface {
        shown: Mutex<Vec<(RequestId, ConsentPrompt)>>,
        closed: Mutex<Vec<RequestId>>,
        broken: bool,
    }

    impl ConsentSurface for RecordingSurface {
        fn show(&self, request: RequestId, prompt: &ConsentPrompt) -> Result<(), SurfaceError> {
            if self.broken {
                return Err(SurfaceError::Unavailable("no notification daemon".to_string()));
            }
            self.shown.lock().unwrap().push((request, prompt.clone()));
            Ok(())
        }

        fn close(&self, request: RequestId) {
            self.closed.lock().unwrap().push(request);
        }
    }

    struct Fixture {
        manager: RequestManager,
        host: Arc<RecordingHost>,
        surface: Arc<RecordingSurface>,
        registry: ActivityReporter,
        consent: ActivityReporter,
    }

    fn catalog() -> FileCatalog {
        FileCatalog {
            providers: vec![Provider {
                id: "google".to_string(),
                display_name: "Google".to_string(),
                icon: None,
            }],
            accounts: vec![Account {
                id: 3,
                provider: "google".to_string(),
                display_name: "alice@example.com".to_string(),
                credentials_id: 17,
            }],
            applications: vec![Application {
                id: "mail.client_mail".to_string(),
                display_name: "Mail".to_string(),
                icon: None,
                desktop_file: None,
                profile: Some("mail.client_mail_2.1".to_string()),
                services: vec![],
            }],
        }
    }

    fn fixture_with(surface: RecordingSurface) -> Fixture {
        let catalog: Arc<dyn Catalog> = Arc::new(catalog());
        let trust = Arc::new(TrustResolver::new(
            Arc::new(NoBus),
            Arc::new(NoProcesses),
            Arc::clone(&catalog),
        ));
        let host = Arc::new(RecordingHost::default());
        let surface = Arc::new(surface);
        let registry = ActivityReporter::detached("requests");
        let consent = ActivityReporter::detached("consent");
        let manager = RequestManager::new(
            trust,
            catalog,
            WindowRouter::new(host.clone()),
            surface.clone(),
        )
        .with_activity(registry.clone(), consent.clone());
        Fixture {
            manager,
            host,
            surface,
            registry,
            consent,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingSurface::default())
    }

    fn map(value: serde_json::Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    fn submit(
        manager: &mut RequestManager,
        interface: Interface,
        profile: &str,
        params: serde_json::Value,
    ) -> (Enqueued, oneshot::Receiver<Reply>) {
        let (reply, rx) = ReplySink::channel();
        let request = manager
            .construct(interface, Caller::new(":1.5", profile), map(params), reply)
            .unwrap();
        (manager.enqueue(request), rx)
    }

    fn started(enqueued: Enqueued) -> RequestId {
        match enqueued {
            Enqueued::Started(id) => id,
            other => panic!("expected a started request, got {:?}", other),
        }
    }

    #[test]
    fn test_provider_request_is_registered() {
        let mut fx = fixture();
        let (enqueued, mut rx) =
            submit(&mut fx.manager, Interface::Accounts, "unconfined", json!({"provider": "foo"}));

        let id = started(enqueued);
        assert_eq!(fx.manager.len(), 1);
        let request = fx.manager.get(id).unwrap();
        assert_eq!(request.kind(), RequestKind::Provider);
        assert!(request.is_in_progress());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(fx.registry.is_busy());
    }

    #[test]
    fn test_invalid_parameters_are_answered_immediately() {
        let mut fx = fixture();
        let (reply, mut rx) = ReplySink::channel();
        let err = fx
            .manager
            .construct(
                Interface::SignOn,
                Caller::new(":1.5", ""),
                map(json!({"identity": 17})),
                reply,
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
        match rx.try_recv() {
            Ok(Reply::Error { kind, .. }) => assert_eq!(kind, ErrorKind::InvalidParameters),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(fx.manager.is_empty());
    }

    #[test]
    fn test_duplicate_is_acknowledged_and_dropped() {
        let mut fx = fixture();
        let params = json!({"requestId": "a", "identity": 17, "method": "oauth2"});
        let (first, mut rx1) = submit(&mut fx.manager, Interface::SignOn, "unconfined", params);
        let first = started(first);

        let params = json!({"requestId": "b", "identity": 17, "method": "oauth2", "windowId": 4});
        let (second, mut rx2) = submit(&mut fx.manager, Interface::SignOn, "unconfined", params);

        assert_eq!(second, Enqueued::Duplicate(first));
        assert_eq!(rx2.try_recv(), Ok(Reply::empty()));
        assert_eq!(rx1.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(fx.manager.len(), 1);
    }

    #[test]
    fn test_panels_are_not_deduplicated() {
        let mut fx = fixture();
        let (a, _rx1) = submit(&mut fx.manager, Interface::Accounts, "unconfined", json!({}));
        let (b, _rx2) = submit(&mut fx.manager, Interface::Accounts, "unconfined", json!({}));
        assert_ne!(started(a), started(b));
        assert_eq!(fx.manager.len(), 2);
    }

    #[test]
    fn test_find_is_superset_match_in_registration_order() {
        let mut fx = fixture();
        let (a, _rx1) = submit(
            &mut fx.manager,
            Interface::Accounts,
            "unconfined",
            json!({"serviceType": "mail", "windowId": 1}),
        );
        let (b, _rx2) = submit(
            &mut fx.manager,
            Interface::Accounts,
            "unconfined",
            json!({"serviceType": "mail", "windowId": 2}),
        );
        let (a, b) = (started(a), started(b));

        let find = |pattern| fx.manager.find(&map(pattern)).map(Request::id);
        assert_eq!(find(json!({"serviceType": "mail"})), Some(a));
        assert_eq!(find(json!({"windowId": 2})), Some(b));
        assert_eq!(find(json!({})), Some(a));
        assert_eq!(find(json!({"serviceType": "mail", "windowId": 3})), None);
        assert_eq!(find(json!({"provider": "google"})), None);
    }

    #[test]
    fn test_completion_deregisters() {
        let mut fx = fixture();
        let (enqueued, mut rx) =
            submit(&mut fx.manager, Interface::Accounts, "unconfined", json!({"provider": "foo"}));
        let id = started(enqueued);

        let result = map(json!({"accountId": 3}));
        assert_eq!(fx.manager.succeed(id, result.clone()), Ok(Outcome::Succeeded));
        assert_eq!(rx.try_recv(), Ok(Reply::Result(result)));
        assert!(fx.manager.is_empty());
        assert!(!fx.registry.is_busy());

        assert_eq!(fx.manager.cancel(id), Err(BrokerError::UnknownRequest(id)));
    }

    #[test]
    fn test_application_must_match_caller() {
        let mut fx = fixture();
        let (enqueued, mut rx) = submit(
            &mut fx.manager,
            Interface::Accounts,
            "evil.app_evil_1",
            json!({"provider": "google", "applicationId": "mail.client_mail"}),
        );
        started(enqueued);

        match rx.try_recv() {
            Ok(Reply::Error { kind, .. }) => assert_eq!(kind, ErrorKind::Forbidden),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(fx.manager.is_empty());
    }

    #[test]
    fn test_unconfined_caller_application_is_accepted() {
        let mut fx = fixture();
        let (enqueued, _rx) = submit(
            &mut fx.manager,
            Interface::Accounts,
            "unconfined",
            json!({"provider": "google", "applicationId": "mail.client_mail"}),
        );
        let id = started(enqueued);
        let app = fx.manager.get(id).unwrap().application().unwrap();
        assert_eq!(app.display_name, "Mail");
    }

    #[test]
    fn test_unknown_account_fails_without_prompt() {
        let mut fx = fixture();
        let (enqueued, mut rx) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "unconfined",
            json!({"requestId": "r1", "identity": 99}),
        );
        let id = started(enqueued);

        let err = fx.manager.present(id, WindowHandle(5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        match rx.try_recv() {
            Ok(Reply::Error { kind, .. }) => assert_eq!(kind, ErrorKind::Forbidden),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(fx.surface.shown.lock().unwrap().is_empty());
        assert!(fx.host.0.lock().unwrap().is_empty());
        assert!(fx.manager.is_empty());
    }

    #[test]
    fn test_consent_continue_shows_held_window() {
        let mut fx = fixture();
        let (enqueued, mut rx) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "mail.client_mail_2.1",
            json!({"requestId": "r1", "identity": 17, "windowId": 77}),
        );
        let id = started(enqueued);

        fx.manager.present(id, WindowHandle(5)).unwrap();
        {
            let shown = fx.surface.shown.lock().unwrap();
            assert_eq!(shown.len(), 1);
            assert_eq!(
                shown[0].1.summary,
                "Please authorize Mail to access your Google account alice@example.com"
            );
        }
        assert!(fx.host.0.lock().unwrap().is_empty());
        assert!(fx.consent.is_busy());

        // Re-presenting while pending changes nothing
        fx.manager.present(id, WindowHandle(6)).unwrap();
        assert_eq!(fx.surface.shown.lock().unwrap().len(), 1);

        let decision = fx.manager.on_consent_event(ConsentEvent::Action {
            request: id,
            action: ACTION_CONTINUE.to_string(),
        });
        assert_eq!(decision, Some(Decision::Granted(WindowHandle(5))));
        assert_eq!(
            fx.host.0.lock().unwrap().as_slice(),
            &[(WindowHandle(5), Some(NativeWindowId(77)))]
        );
        assert!(!fx.consent.is_busy());

        // Granted: the request proceeds through its own flow
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        fx.manager.present(id, WindowHandle(5)).unwrap();
        assert_eq!(fx.host.0.lock().unwrap().len(), 1);

        fx.manager.succeed(id, map(json!({"Secret": "x"}))).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Reply::Result(_))));
        assert!(fx.manager.is_empty());
    }

    #[test]
    fn test_consent_cancel_fails_once() {
        let mut fx = fixture();
        let (enqueued, mut rx) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "",
            json!({"requestId": "r1", "identity": 17}),
        );
        let id = started(enqueued);
        fx.manager.present(id, WindowHandle(5)).unwrap();
        assert_eq!(
            fx.surface.shown.lock().unwrap()[0].1.summary,
            "Please authorize Ubuntu to access your Google account alice@example.com"
        );

        let decision = fx.manager.on_consent_event(ConsentEvent::Action {
            request: id,
            action: ACTION_CANCEL.to_string(),
        });
        assert_eq!(decision, Some(Decision::Denied));
        match rx.try_recv() {
            Ok(Reply::Error { kind, .. }) => assert_eq!(kind, ErrorKind::Forbidden),
            other => panic!("unexpected reply {:?}", other),
        }

        // The surface reporting its closure afterwards is ignored
        assert_eq!(
            fx.manager.on_consent_event(ConsentEvent::Closed { request: id }),
            None
        );
        assert!(fx.host.0.lock().unwrap().is_empty());
        assert!(fx.manager.is_empty());
        assert!(fx.surface.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dismissed_prompt_denies() {
        let mut fx = fixture();
        let (enqueued, mut rx) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "unconfined",
            json!({"requestId": "r1", "identity": 17, "openUrl": "https://accounts.example.com"}),
        );
        let id = started(enqueued);
        fx.manager.present(id, WindowHandle(5)).unwrap();

        assert_eq!(
            fx.manager.on_consent_event(ConsentEvent::Closed { request: id }),
            Some(Decision::Denied)
        );
        assert!(matches!(
            rx.try_recv(),
            Ok(Reply::Error { kind: ErrorKind::Forbidden, .. })
        ));
    }

    #[test]
    fn test_cancel_while_pending_withdraws_prompt() {
        let mut fx = fixture();
        let (enqueued, mut rx) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "unconfined",
            json!({"requestId": "r1", "identity": 17}),
        );
        let id = started(enqueued);
        fx.manager.present(id, WindowHandle(5)).unwrap();

        let pattern = map(json!({"requestId": "r1"}));
        // Another connection can't cancel it
        assert_eq!(fx.manager.cancel_matching(":1.9", &pattern), None);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(fx.manager.cancel_matching(":1.5", &pattern), Some(id));
        assert_eq!(
            rx.try_recv(),
            Ok(Reply::error(ErrorKind::UserCanceled, "Canceled"))
        );
        assert_eq!(fx.surface.closed.lock().unwrap().as_slice(), &[id]);
        assert!(!fx.consent.is_busy());
        assert_eq!(fx.manager.cancel_matching(":1.5", &pattern), None);
    }

    #[test]
    fn test_broken_surface_fails_closed() {
        let mut fx = fixture_with(RecordingSurface {
            broken: true,
            ..Default::default()
        });
        let (enqueued, mut rx) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "unconfined",
            json!({"requestId": "r1", "identity": 17}),
        );
        let id = started(enqueued);

        assert!(fx.manager.present(id, WindowHandle(5)).is_err());
        assert!(matches!(
            rx.try_recv(),
            Ok(Reply::Error { kind: ErrorKind::Forbidden, .. })
        ));
        assert!(fx.host.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_accounts_requests_show_without_consent() {
        let mut fx = fixture();
        let (enqueued, _rx) = submit(
            &mut fx.manager,
            Interface::Accounts,
            "unconfined",
            json!({"provider": "google", "windowId": 12}),
        );
        let id = started(enqueued);

        fx.manager.present(id, WindowHandle(1)).unwrap();
        assert_eq!(
            fx.host.0.lock().unwrap().as_slice(),
            &[(WindowHandle(1), Some(NativeWindowId(12)))]
        );
        assert!(fx.surface.shown.lock().unwrap().is_empty());
        assert_eq!(fx.manager.snapshot()[0].window, Some(WindowHandle(1)));
    }

    #[test]
    fn test_cancel_for_connection_and_all() {
        let mut fx = fixture();
        let (a, mut rx1) = submit(&mut fx.manager, Interface::Accounts, "unconfined", json!({}));
        started(a);

        let (reply, mut rx2) = ReplySink::channel();
        let other = fx
            .manager
            .construct(Interface::Accounts, Caller::new(":1.9", ""), Parameters::new(), reply)
            .unwrap();
        started(fx.manager.enqueue(other));

        assert_eq!(fx.manager.cancel_for_connection(":1.5"), 1);
        assert!(matches!(
            rx1.try_recv(),
            Ok(Reply::Error { kind: ErrorKind::UserCanceled, .. })
        ));
        assert_eq!(fx.manager.len(), 1);

        assert_eq!(fx.manager.cancel_all(), 1);
        assert!(matches!(
            rx2.try_recv(),
            Ok(Reply::Error { kind: ErrorKind::UserCanceled, .. })
        ));
        assert!(fx.manager.is_empty());
        assert!(!fx.registry.is_busy());
    }

    #[test]
    fn test_dedup_holds_in_both_directions() {
        let broad = json!({"provider": "google"});
        let narrow = json!({"provider": "google", "serviceType": "mail"});

        // Narrow key first: the broad request matches it
        let mut fx = fixture();
        let (first, _rx1) = submit(&mut fx.manager, Interface::Accounts, "unconfined", narrow.clone());
        let first = started(first);
        let (second, mut rx2) = submit(&mut fx.manager, Interface::Accounts, "unconfined", broad.clone());
        assert_eq!(second, Enqueued::Duplicate(first));
        assert_eq!(rx2.try_recv(), Ok(Reply::empty()));
        assert_eq!(fx.manager.len(), 1);

        // Broad key first: the narrow request's parameters cover it
        let mut fx = fixture();
        let (first, _rx1) = submit(&mut fx.manager, Interface::Accounts, "unconfined", broad);
        let first = started(first);
        let (second, mut rx2) = submit(&mut fx.manager, Interface::Accounts, "unconfined", narrow);
        assert_eq!(second, Enqueued::Duplicate(first));
        assert_eq!(rx2.try_recv(), Ok(Reply::empty()));
        assert_eq!(fx.manager.len(), 1);

        // A single live request matches the dedup key
        let key = fx.manager.get(first).unwrap().dedup_key();
        assert_eq!(fx.manager.find(&key).map(Request::id), Some(first));
    }

    #[test]
    fn test_unrelated_requests_are_both_registered() {
        let mut fx = fixture();
        let (a, _rx1) = submit(
            &mut fx.manager,
            Interface::Accounts,
            "unconfined",
            json!({"provider": "google", "serviceType": "mail"}),
        );
        let (b, _rx2) = submit(
            &mut fx.manager,
            Interface::Accounts,
            "unconfined",
            json!({"provider": "google", "serviceType": "calendar"}),
        );
        assert_ne!(started(a), started(b));
        assert_eq!(fx.manager.len(), 2);
    }

    #[test]
    fn test_succeed_requires_granted_consent() {
        let mut fx = fixture();
        let (enqueued, mut rx) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "unconfined",
            json!({"requestId": "r1", "identity": 17}),
        );
        let id = started(enqueued);
        let result = map(json!({"Secret": "x"}));

        // Not presented yet
        assert_eq!(
            fx.manager.succeed(id, result.clone()),
            Err(BrokerError::ConsentRequired(id))
        );

        // Prompt shown, user hasn't answered
        fx.manager.present(id, WindowHandle(5)).unwrap();
        assert_eq!(
            fx.manager.succeed(id, result.clone()),
            Err(BrokerError::ConsentRequired(id))
        );
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(fx.surface.closed.lock().unwrap().is_empty());
        assert!(fx.manager.get(id).unwrap().consent_pending());

        // Failing is still allowed
        assert_eq!(
            fx.manager.fail(id, ErrorKind::UserCanceled, "Dialog closed"),
            Ok(Outcome::Canceled)
        );
        assert_eq!(
            rx.try_recv(),
            Ok(Reply::error(ErrorKind::UserCanceled, "Dialog closed"))
        );
        assert_eq!(fx.surface.closed.lock().unwrap().as_slice(), &[id]);
    }

    #[test]
    fn test_snapshot_reports_provider() {
        let mut fx = fixture();
        let (a, _rx1) = submit(
            &mut fx.manager,
            Interface::Accounts,
            "unconfined",
            json!({"provider": "google"}),
        );
        let (b, _rx2) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "unconfined",
            json!({"requestId": "r1", "identity": 17}),
        );
        let (c, _rx3) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "unconfined",
            json!({"requestId": "r2", "identity": 99, "clientData": {"providerId": "facebook"}}),
        );
        let (d, _rx4) = submit(
            &mut fx.manager,
            Interface::SignOn,
            "unconfined",
            json!({"requestId": "r3", "identity": 98}),
        );
        let ids = [started(a), started(b), started(c), started(d)];

        let snapshot = fx.manager.snapshot();
        let providers: Vec<_> = snapshot.iter().map(|s| s.provider.as_deref()).collect();
        assert_eq!(snapshot.iter().map(|s| s.id).collect::<Vec<_>>(), ids);
        assert_eq!(
            providers,
            vec![Some("google"), Some("google"), Some("facebook"), None]
        );
    }
}
