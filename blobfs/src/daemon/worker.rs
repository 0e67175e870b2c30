use crate::config::INVALIDATION_TOPIC;
use crate::vfs::{FsContext, PathKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Renews the lease of every open writer on a fixed period.
pub struct LeaseRenewer {
    ctx: Arc<FsContext>,
    period: Duration,
}

impl LeaseRenewer {
    pub fn new(ctx: Arc<FsContext>) -> Self {
        let period = ctx.config.renew_interval;
        Self { ctx, period }
    }

    /// One pass over the handle table. Returns how many leases were renewed.
    pub async fn renew_all(&self) -> usize {
        let mut renewed = 0;
        for writer in self.ctx.handles.writers() {
            // fsync 后句柄仍在表中，但租约已释放
            if writer.is_closed().await {
                continue;
            }
            match writer.renew_lease().await {
                Ok(()) => renewed += 1,
                // 句柄可能正在关闭，下一轮自然消失
                Err(e) => warn!(blob = %writer.blob(), error = %e, "lease renewal failed"),
            }
        }
        renewed
    }

    pub async fn run(self, token: CancellationToken) {
        info!(period = ?self.period, "lease renewer started");
        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => {
                    let renewed = self.renew_all().await;
                    if renewed > 0 {
                        debug!(renewed, "leases renewed");
                    }
                }
            }
        }
        info!("lease renewer stopped");
    }
}

/// Drains this mount's subscription on the invalidation topic and applies each path locally.
pub struct InvalidationListener {
    ctx: Arc<FsContext>,
    subscription: String,
    period: Duration,
}

impl InvalidationListener {
    pub fn new(ctx: Arc<FsContext>, subscription: impl Into<String>) -> Self {
        let period = ctx.config.listen_interval;
        Self {
            ctx,
            subscription: subscription.into(),
            period,
        }
    }

    /// Applies every pending message. Returns how many were applied.
    pub async fn drain(&self) -> usize {
        let mut applied = 0;
        loop {
            let body = match self
                .ctx
                .bus
                .receive(INVALIDATION_TOPIC, &self.subscription)
                .await
            {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "receive invalidation failed");
                    break;
                }
            };
            let path = self.ctx.resolver.parse(&body);
            // 以存储中的当前状态决定失效范围，不经过缓存
            let kind = match self.ctx.resolver.classify(&path).await {
                Ok(info) => info.kind,
                Err(e) => {
                    debug!(path = path.full(), error = %e, "classify failed, dropping prefix");
                    PathKind::Invalid
                }
            };
            self.ctx.invalidator.apply(&path, kind);
            debug!(path = path.full(), ?kind, "applied remote invalidation");
            applied += 1;
        }
        applied
    }

    pub async fn run(self, token: CancellationToken) {
        info!(subscription = %self.subscription, "invalidation listener started");
        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => {
                    self.drain().await;
                }
            }
        }
        info!("invalidation listener stopped");
    }
}
