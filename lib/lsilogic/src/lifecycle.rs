// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use futures::future::BoxFuture;

use crate::migrate::Migrator;

/// Events delivered to an emulated controller as its instance is started,
/// paused, reset and eventually torn down.
///
/// These must be called from within a [Tokio runtime](tokio::runtime::Runtime),
/// since a controller may spawn its request worker onto it.
pub trait Lifecycle: Send + Sync + 'static {
    /// Name identifying the kind of device.
    fn type_name(&self) -> &'static str;

    /// Begin servicing the guest.
    fn start(&self) -> anyhow::Result<()>;

    /// Stop pulling new requests from the guest.  Requests the guest posts
    /// while paused are kept until [Lifecycle::resume].
    fn pause(&self);

    /// Resolves once every request handed to a backend before the pause has
    /// been completed.
    fn paused(&self) -> BoxFuture<'static, ()>;

    fn resume(&self);

    /// Return to cold-start state.
    fn reset(&self);

    /// The instance is going away.
    fn halt(&self);

    fn migrate(&'_ self) -> Migrator<'_>;
}
