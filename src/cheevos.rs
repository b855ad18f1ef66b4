use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::{Error, Result};

mod regions;

use regions::VirtualRegion;

const HTTP_SLOTS: usize = 32;
const EVENT_SLOTS: usize = 64;

/// Synchronous answer for requests the bridge cannot queue.
const STATUS_QUEUE_FULL: i32 = 429;

/// An HTTP request the achievements runtime wants performed. The client
/// drains these, performs the transfer, and answers by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub id: u32,
    pub url: String,
    pub post_body: Option<String>,
    pub content_type: Option<String>,
}

/// The client's answer to an [`HttpRequest`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: i32,
    pub body: Vec<u8>,
}

impl HttpResponse {
    fn queue_full() -> Self {
        Self {
            status: STATUS_QUEUE_FULL,
            body: Vec::new(),
        }
    }
}

/// A server call as issued by the runtime; `handle` is the runtime's own
/// continuation token, echoed back on delivery.
#[derive(Debug, Clone)]
pub struct ServerCall {
    pub url: String,
    pub post_body: Option<String>,
    pub content_type: Option<String>,
    pub handle: u64,
}

/// Events surfaced to the client, normalized to plain values.
///
/// Challenge, progress and leaderboard activity is deliberately filtered
/// out: surfacing it would read as spurious unlock toasts.
#[derive(Debug, Clone, PartialEq)]
pub enum RcEvent {
    AchievementUnlocked {
        title: String,
        description: String,
        badge_url: String,
        points: u32,
        rarity: f32,
    },
    GameCompleted,
    SubsetCompleted,
    ServerError {
        api: String,
        message: String,
    },
    Disconnected,
    Reconnected,
    LoginSuccess {
        user_name: String,
    },
    LoginFailure {
        message: String,
    },
    LoadGameSuccess {
        game_title: String,
        game_id: u32,
    },
    LoadGameFailure {
        message: String,
    },
    ChallengeIndicator,
    ProgressIndicator,
    LeaderboardActivity,
}

impl RcEvent {
    fn enqueueable(&self) -> bool {
        !matches!(
            self,
            RcEvent::ChallengeIndicator | RcEvent::ProgressIndicator | RcEvent::LeaderboardActivity
        )
    }
}

/// What the bridge offers the runtime while a call into it is in flight.
pub trait RuntimeHost {
    /// Read `out.len()` bytes at a *virtual* console address. Bytes outside
    /// every mapped region read as zero.
    fn read_memory(&mut self, address: u32, out: &mut [u8]) -> usize;

    /// Queue an HTTP request for the client to perform.
    fn server_call(&mut self, call: ServerCall);

    /// Surface an event to the client.
    fn emit(&mut self, event: RcEvent);
}

/// Seam for the external RetroAchievements runtime library.
///
/// The embedder wraps the real runtime (an FFI binding holding its own
/// state) in this trait; tests substitute a stub. Calls arrive with a
/// [`RuntimeHost`] the runtime uses for memory reads, server calls and
/// event emission.
pub trait Runtime: Send {
    fn login_with_token(&mut self, host: &mut dyn RuntimeHost, user: &str, token: &str);
    fn load_game(&mut self, host: &mut dyn RuntimeHost, hash: &str);
    fn unload_game(&mut self, host: &mut dyn RuntimeHost);
    fn reset(&mut self, host: &mut dyn RuntimeHost);
    fn logout(&mut self, host: &mut dyn RuntimeHost);
    fn set_hardcore(&mut self, enabled: bool);
    fn set_encore(&mut self, enabled: bool);
    fn do_frame(&mut self, host: &mut dyn RuntimeHost);
    fn idle(&mut self, host: &mut dyn RuntimeHost);

    /// Complete an earlier [`RuntimeHost::server_call`]. May issue further
    /// server calls from within.
    fn deliver_response(&mut self, host: &mut dyn RuntimeHost, handle: u64, response: HttpResponse);

    fn console_id(&self) -> Option<u32>;
    fn is_logged_in(&self) -> bool;
    fn user_name(&self) -> Option<String>;
    fn game_title(&self) -> Option<String>;
    fn game_id(&self) -> Option<u32>;
    fn achievement_count(&self) -> u32;
    fn unlocked_count(&self) -> u32;
    fn total_points(&self) -> u32;
    fn unlocked_points(&self) -> u32;
}

/// Reads emulator memory at a *real* address; wired to the memory-region
/// resolver in production and to fakes in tests.
pub(crate) type RawReader = Box<dyn FnMut(usize, &mut [u8]) -> usize + Send>;

struct PendingCall {
    id: u32,
    url: String,
    post_body: Option<String>,
    content_type: Option<String>,
    handle: u64,
    polled: bool,
}

/// Fixed-slot table of HTTP requests awaiting the client. Ids are
/// monotonically increasing and never zero; a slot frees when its
/// response is submitted.
struct PendingTable {
    slots: Vec<Option<PendingCall>>,
    next_id: u32,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            slots: (0..HTTP_SLOTS).map(|_| None).collect(),
            next_id: 1,
        }
    }

    fn insert(&mut self, call: ServerCall) -> Result<u32> {
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            return Err(Error::BridgeFull);
        };

        let id = self.next_id;
        self.next_id = match self.next_id.wrapping_add(1) {
            0 => 1,
            next => next,
        };

        *slot = Some(PendingCall {
            id,
            url: call.url,
            post_body: call.post_body,
            content_type: call.content_type,
            handle: call.handle,
            polled: false,
        });

        Ok(id)
    }

    fn poll(&mut self) -> Option<HttpRequest> {
        let call = self
            .slots
            .iter_mut()
            .flatten()
            .filter(|call| !call.polled)
            .min_by_key(|call| call.id)?;

        call.polled = true;

        Some(HttpRequest {
            id: call.id,
            url: call.url.clone(),
            post_body: call.post_body.clone(),
            content_type: call.content_type.clone(),
        })
    }

    fn take(&mut self, id: u32) -> Option<PendingCall> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|call| call.id == id))?
            .take()
    }

    fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// Bounded event queue with drop-oldest overflow.
struct EventQueue {
    queue: VecDeque<RcEvent>,
    dropped: u64,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(EVENT_SLOTS),
            dropped: 0,
        }
    }

    /// Enqueue an event. The newest event always lands; `Err` reports
    /// that the queue was full and the oldest was evicted to make room.
    fn push(&mut self, event: RcEvent) -> Result<()> {
        if !event.enqueueable() {
            return Ok(());
        }

        let overflowed = self.queue.len() == EVENT_SLOTS;
        if overflowed {
            self.queue.pop_front();
            self.dropped += 1;
        }

        self.queue.push_back(event);

        if overflowed {
            Err(Error::BridgeFull)
        } else {
            Ok(())
        }
    }

    fn pop(&mut self) -> Option<RcEvent> {
        self.queue.pop_front()
    }
}

/// The adaptor between the achievements runtime and the client: queues on
/// one side, the emulator memory resolver on the other.
pub(crate) struct CheevosBridge {
    runtime: Option<Box<dyn Runtime>>,
    pending: PendingTable,
    events: EventQueue,
    regions: Option<&'static [VirtualRegion]>,
    reader: RawReader,
}

impl CheevosBridge {
    pub fn new(reader: RawReader) -> Self {
        Self {
            runtime: None,
            pending: PendingTable::new(),
            events: EventQueue::new(),
            regions: None,
            reader,
        }
    }

    pub fn attach(&mut self, runtime: Box<dyn Runtime>) {
        self.runtime = Some(runtime);
        self.regions = None;
    }

    pub fn detach(&mut self) -> bool {
        self.regions = None;
        self.runtime.take().is_some()
    }

    pub fn login_with_token(&mut self, user: &str, token: &str) {
        let (user, token) = (user.to_owned(), token.to_owned());
        self.with_runtime(move |runtime, host| runtime.login_with_token(host, &user, &token));
    }

    pub fn load_game(&mut self, hash: &str) {
        self.regions = None;
        let hash = hash.to_owned();
        self.with_runtime(move |runtime, host| runtime.load_game(host, &hash));
    }

    pub fn unload_game(&mut self) {
        self.regions = None;
        self.with_runtime(|runtime, host| runtime.unload_game(host));
    }

    pub fn reset(&mut self) {
        self.with_runtime(|runtime, host| runtime.reset(host));
    }

    pub fn logout(&mut self) {
        self.with_runtime(|runtime, host| runtime.logout(host));
    }

    pub fn set_hardcore(&mut self, enabled: bool) {
        if let Some(runtime) = self.runtime.as_mut() {
            runtime.set_hardcore(enabled);
        }
    }

    pub fn set_encore(&mut self, enabled: bool) {
        if let Some(runtime) = self.runtime.as_mut() {
            runtime.set_encore(enabled);
        }
    }

    pub fn do_frame(&mut self) {
        self.with_runtime(|runtime, host| runtime.do_frame(host));
    }

    pub fn idle(&mut self) {
        self.with_runtime(|runtime, host| runtime.idle(host));
    }

    pub fn poll_http(&mut self) -> Option<HttpRequest> {
        self.pending.poll()
    }

    /// Complete request `id`. The slot is reclaimed *before* the
    /// continuation runs, so a continuation that issues a follow-up call
    /// always sees the freed slot.
    pub fn submit_http(&mut self, id: u32, response: HttpResponse) -> Result<()> {
        let call = self
            .pending
            .take(id)
            .ok_or(Error::State("unknown http request id"))?;

        self.deliver(call.handle, response);

        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<RcEvent> {
        self.events.pop()
    }

    pub fn runtime(&self) -> Option<&dyn Runtime> {
        self.runtime.as_deref()
    }

    fn deliver(&mut self, handle: u64, response: HttpResponse) {
        self.with_runtime(move |runtime, host| runtime.deliver_response(host, handle, response));
    }

    /// Lend the runtime out together with a host view over the queues.
    /// Requests rejected for lack of a slot are answered after the
    /// runtime call returns, when it can be re-entered.
    fn with_runtime<R>(
        &mut self,
        f: impl FnOnce(&mut dyn Runtime, &mut dyn RuntimeHost) -> R,
    ) -> Option<R> {
        let mut runtime = self.runtime.take()?;
        let console = runtime.console_id();

        let mut host = BridgeHost {
            pending: &mut self.pending,
            events: &mut self.events,
            regions: &mut self.regions,
            console,
            reader: &mut self.reader,
            rejected: Vec::new(),
        };

        let result = f(runtime.as_mut(), &mut host);
        let rejected = host.rejected;

        self.runtime = Some(runtime);

        for handle in rejected {
            self.deliver(handle, HttpResponse::queue_full());
        }

        Some(result)
    }
}

struct BridgeHost<'a> {
    pending: &'a mut PendingTable,
    events: &'a mut EventQueue,
    regions: &'a mut Option<&'static [VirtualRegion]>,
    console: Option<u32>,
    reader: &'a mut RawReader,
    rejected: Vec<u64>,
}

impl RuntimeHost for BridgeHost<'_> {
    fn read_memory(&mut self, address: u32, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }

        // The console id appears once the runtime has identified the game;
        // load the platform table lazily on the first read after that.
        if self.regions.is_none() {
            *self.regions = self.console.and_then(regions::for_console);
            if let Some(regions) = *self.regions {
                debug!(console = ?self.console, regions = regions.len(), "address map loaded");
            }
        }

        let Some(regions) = *self.regions else {
            out.fill(0);
            return out.len();
        };

        let end = address as u64 + out.len() as u64 - 1;
        let bulk = regions
            .iter()
            .find(|region| region.contains(address) && end <= u64::from(u32::MAX) && region.contains(end as u32));

        if let Some(region) = bulk {
            // The common case: one translation, one bulk read.
            let real = region.translate(address);
            let n = (self.reader)(real, out);
            out[n..].fill(0);

            return out.len();
        }

        for (offset, byte) in out.iter_mut().enumerate() {
            let addr = address.wrapping_add(offset as u32);
            *byte = match regions.iter().find(|region| region.contains(addr)) {
                Some(region) => {
                    let mut one = [0u8];
                    if (self.reader)(region.translate(addr), &mut one) == 1 {
                        one[0]
                    } else {
                        0
                    }
                }
                None => 0,
            };
        }

        out.len()
    }

    fn server_call(&mut self, call: ServerCall) {
        let handle = call.handle;

        match self.pending.insert(call) {
            Ok(id) => debug!(id, "http request queued"),
            Err(err) => {
                warn!(%err, handle, "http request rejected, answering client error");
                self.rejected.push(handle);
            }
        }
    }

    fn emit(&mut self, event: RcEvent) {
        if let Err(err) = self.events.push(event) {
            warn!(%err, "event queue overflow, dropped the oldest");
        }
    }
}
