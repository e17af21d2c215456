// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Anisette data acquisition.
//!
//! Anisette data is minted by a responder outside this process (an Apple
//! frameworks shim, a helper plug-in, or a remote service). The relay here
//! owns the request/response bookkeeping: each request is keyed by a fresh
//! token, announced to the responder, and resolved by whichever response
//! arrives carrying that token. A responder that stays silent past the
//! deadline fails the request deterministically; responses for tokens that
//! already timed out are dropped.

use {
    crate::error::SideloadError,
    apple_developer_services::AnisetteData,
    async_trait::async_trait,
    log::{debug, warn},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex, Weak},
        time::Duration,
    },
    tokio::sync::oneshot,
    uuid::Uuid,
};

/// How long to wait for a responder before giving up.
pub const ANISETTE_TIMEOUT: Duration = Duration::from_secs(1);

/// Something that can produce anisette data on demand.
#[async_trait]
pub trait AnisetteProvider: Send + Sync {
    async fn fetch_anisette_data(&self) -> Result<AnisetteData, SideloadError>;
}

/// Announces an outstanding anisette request to an out-of-band responder.
///
/// Implementations must not block; responses come back asynchronously via
/// [`AnisetteRelay::deliver`].
pub trait AnisetteRequester: Send + Sync {
    fn request(&self, token: Uuid);
}

type PendingRequest = oneshot::Sender<Result<AnisetteData, SideloadError>>;

/// Token-keyed rendezvous between anisette requests and responses.
pub struct AnisetteRelay {
    requester: Arc<dyn AnisetteRequester>,
    timeout: Duration,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
}

impl AnisetteRelay {
    pub fn new(requester: Arc<dyn AnisetteRequester>) -> Self {
        Self::with_timeout(requester, ANISETTE_TIMEOUT)
    }

    pub fn with_timeout(requester: Arc<dyn AnisetteRequester>, timeout: Duration) -> Self {
        Self {
            requester,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Hand a responder's answer to the caller waiting on `token`.
    ///
    /// `None` indicates the responder answered without usable payload data.
    /// Answers for unknown tokens — including requests that have already
    /// timed out — are dropped.
    pub fn deliver(&self, token: Uuid, data: Option<AnisetteData>) {
        let sender = self
            .pending
            .lock()
            .expect("anisette pending lock should never be poisoned")
            .remove(&token);

        match sender {
            Some(sender) => {
                // The receiver may have been dropped concurrently with the
                // timeout; that is equivalent to a late response.
                let _ = sender.send(data.ok_or(SideloadError::InvalidAnisetteData));
            }
            None => {
                debug!("dropping anisette response for expired token {}", token);
            }
        }
    }
}

#[async_trait]
impl AnisetteProvider for AnisetteRelay {
    async fn fetch_anisette_data(&self) -> Result<AnisetteData, SideloadError> {
        let token = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();

        self.pending
            .lock()
            .expect("anisette pending lock should never be poisoned")
            .insert(token, sender);

        self.requester.request(token);

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SideloadError::AnisetteUnavailable),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("anisette pending lock should never be poisoned")
                    .remove(&token);

                Err(SideloadError::AnisetteUnavailable)
            }
        }
    }
}

/// Responder that fetches anisette data from an HTTP service.
///
/// Several community services expose freshly minted anisette headers as a
/// JSON object; this requester fetches one per request and feeds it back
/// through the relay so the relay's timeout and token semantics apply
/// unchanged.
pub struct HttpAnisetteRequester {
    client: reqwest::Client,
    url: String,
    relay: Mutex<Weak<AnisetteRelay>>,
}

impl AnisetteRequester for HttpAnisetteRequester {
    fn request(&self, token: Uuid) {
        let relay = self
            .relay
            .lock()
            .expect("anisette relay lock should never be poisoned")
            .upgrade();
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            let relay = match relay {
                Some(relay) => relay,
                None => return,
            };

            match fetch_anisette_json(&client, &url).await {
                Ok(data) => relay.deliver(token, data),
                Err(error) => {
                    // Leaving the token unresolved lets the relay's timeout
                    // report unavailability rather than invalid data.
                    warn!("anisette fetch from {} failed: {}", url, error);
                }
            }
        });
    }
}

/// Build a relay backed by an HTTP anisette service.
pub fn http_anisette_relay(url: impl ToString) -> Arc<AnisetteRelay> {
    let requester = Arc::new(HttpAnisetteRequester {
        client: reqwest::Client::new(),
        url: url.to_string(),
        relay: Mutex::new(Weak::new()),
    });

    let relay = Arc::new(AnisetteRelay::new(requester.clone()));
    *requester
        .relay
        .lock()
        .expect("anisette relay lock should never be poisoned") = Arc::downgrade(&relay);

    relay
}

async fn fetch_anisette_json(
    client: &reqwest::Client,
    url: &str,
) -> Result<Option<AnisetteData>, reqwest::Error> {
    let response = client.get(url).send().await?.error_for_status()?;
    let payload = response.json::<serde_json::Value>().await?;

    Ok(anisette_from_json(&payload))
}

/// Decode the JSON header map served by anisette services.
///
/// Returns `None` when required headers are absent, which the relay
/// surfaces as invalid data.
fn anisette_from_json(payload: &serde_json::Value) -> Option<AnisetteData> {
    let header = |name: &str| payload.get(name).and_then(|v| v.as_str());

    Some(AnisetteData {
        machine_id: header("X-Apple-I-MD-M")?.to_string(),
        one_time_password: header("X-Apple-I-MD")?.to_string(),
        local_user_id: header("X-Apple-I-MD-LU")?.to_string(),
        routing_info: header("X-Apple-I-MD-RINFO")
            .and_then(|value| value.parse().ok())
            .unwrap_or(17106176),
        device_unique_identifier: header("X-Mme-Device-Id")
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string().to_uppercase()),
        device_serial_number: header("X-Apple-I-SRL-NO").unwrap_or("0").to_string(),
        device_description: header("X-Mme-Client-Info")?.to_string(),
        date: chrono_now(),
        locale: header("X-Apple-Locale").unwrap_or("en_US").to_string(),
        time_zone: header("X-Apple-I-TimeZone").unwrap_or("UTC").to_string(),
    })
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
