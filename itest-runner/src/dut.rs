//! Device under test connection.

use async_trait::async_trait;
use itest_common::Context;

/// Connection to the device a test runs against.
///
/// The runner only needs to know whether the link is up and how to bring it
/// back; everything else is up to the implementation.
#[async_trait]
pub trait RemoteDevice: Send + Sync {
    async fn connected(&self, ctx: &Context) -> bool;

    async fn connect(&self, ctx: &Context) -> anyhow::Result<()>;
}
