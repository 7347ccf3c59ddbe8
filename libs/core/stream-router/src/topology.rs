//! Queue topology
//!
//! Every logical queue owns three queue/exchange pairs:
//!
//! ```text
//!   publish ──► <q>_instant_exchange ──► <q>_instant_queue ──► consumer
//!                      ▲                                          │ Retry
//!                      │ expired                                  ▼
//!               <q>_delay_queue  ◄── <q>_delay_exchange ◄──── retry manager
//!                                                                 │ exhausted
//!               <q>_dlq_queue    ◄── <q>_dlq_exchange   ◄─────────┘
//! ```

use crate::broker::{BrokerAdmin, ExchangeKind, QueueArgs};
use crate::error::BrokerError;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{debug, instrument};

/// The three paths of a logical queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum QueueType {
    Instant,
    Delay,
    Dlq,
}

/// `"<queue>_<type>_queue"`
pub fn queue_name(queue: &str, queue_type: QueueType) -> String {
    format!("{}_{}_queue", queue, queue_type.as_ref())
}

/// `"<queue>_<type>_exchange"`
pub fn exchange_name(queue: &str, queue_type: QueueType) -> String {
    format!("{}_{}_exchange", queue, queue_type.as_ref())
}

/// Declare the instant, delay and dead-letter paths for `queue`.
///
/// Safe to call repeatedly. Expired delay messages dead-letter into the
/// instant exchange.
#[instrument(skip(admin))]
pub async fn declare_topology<A>(admin: &A, queue: &str) -> Result<(), BrokerError>
where
    A: BrokerAdmin + ?Sized,
{
    for queue_type in QueueType::iter() {
        let exchange = exchange_name(queue, queue_type);
        let name = queue_name(queue, queue_type);

        let args = match queue_type {
            QueueType::Delay => QueueArgs::default().dead_letter_to(exchange_name(queue, QueueType::Instant)),
            QueueType::Instant | QueueType::Dlq => QueueArgs::default(),
        };

        admin.declare_exchange(&exchange, ExchangeKind::Fanout).await?;
        admin.declare_queue(&name, args).await?;
        admin.bind_queue(&name, &exchange, "").await?;

        debug!(queue = %name, exchange = %exchange, "Declared queue path");
    }

    Ok(())
}
