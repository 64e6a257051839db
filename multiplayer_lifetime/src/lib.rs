// multiplayer_lifetime — scoped resource management for the multiplayer relay.
//
// Everything in the relay that has to be torn down (subscriptions, sockets,
// reader threads, registry entries) is attached to a `Lifetime`. Ending the
// lifetime runs the attached cleanups exactly once. Asynchronous results
// travel through `Promise`s, and notifications through `Event`s whose
// subscriptions are themselves bound to a lifetime.
//
// Module overview:
// - `promise.rs`:  `Deferred` (producer) / `Promise` (consumer) pair for one
//                  value that arrives later. Waitable, awaitable, and with
//                  continuations.
// - `lifetime.rs`: `Lifetime` (owning handle that can end the scope) and
//                  `LifetimeManager` (registration-only view), plus the
//                  child / earliest-of / when-all combinators and the
//                  `forever` singleton.
// - `event.rs`:    `Event<T>`, a synchronous observer list keyed by owning
//                  lifetime.
// - `error.rs`:    `ProtocolViolation`, returned on misuse of a `Deferred`.
//
// No async runtime. Continuations and event handlers run on whichever thread
// settles the promise or fires the event.

pub mod error;
pub mod event;
pub mod lifetime;
pub mod promise;

mod sync;

pub use error::ProtocolViolation;
pub use event::Event;
pub use lifetime::{Disposable, Lifetime, LifetimeManager};
pub use promise::{Deferred, Promise};
