//! A self-contained order flow on the in-memory transport.
//!
//! `PlaceOrder` commands are sent to the endpoint itself. Their handler
//! fails on the first attempt of every order so the retry path runs, then
//! publishes `OrderPlaced`, which the same endpoint is subscribed to.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Context as _, Result},
    async_trait::async_trait,
    clap::Args,
    dashmap::DashSet,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::sync::mpsc,
    tracing::{info, warn},
};

use {
    conveyor_common::{MessageMetadata, PublishOptions, SendOptions},
    conveyor_config::ConveyorConfig,
    conveyor_endpoint::{
        Endpoint, EndpointBuilder, InMemoryBroker, InMemoryTransport, MessageHandler,
        MessageHandlerContext, keys,
    },
};

const PLACE_ORDER: &str = "PlaceOrder";
const ORDER_PLACED: &str = "OrderPlaced";

#[derive(Args)]
pub struct DemoArgs {
    /// Number of orders to send.
    #[arg(long, default_value_t = 5)]
    orders: u32,
    /// Give up waiting for the orders after this long, e.g. `30s`.
    #[arg(long, default_value = "30s")]
    timeout: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlaceOrder {
    order: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order: u32,
}

/// Fails the first attempt of each order, then publishes `OrderPlaced`.
struct PlaceOrderHandler {
    attempted: DashSet<u32>,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl MessageHandler for PlaceOrderHandler {
    fn message_type(&self) -> &str {
        PLACE_ORDER
    }

    fn name(&self) -> &str {
        "PlaceOrderHandler"
    }

    async fn handle(&self, message: &Value, context: &mut MessageHandlerContext) -> Result<()> {
        let command: PlaceOrder = serde_json::from_value(message.clone())?;
        if self.attempted.insert(command.order) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            anyhow::bail!("inventory service unavailable for order {}", command.order);
        }
        info!(order = command.order, "order accepted");
        context
            .publish(
                ORDER_PLACED,
                &OrderPlaced {
                    order: command.order,
                },
                PublishOptions::new(),
            )
            .await
    }
}

struct OrderPlacedHandler {
    shipped: mpsc::UnboundedSender<u32>,
}

#[async_trait]
impl MessageHandler for OrderPlacedHandler {
    fn message_type(&self) -> &str {
        ORDER_PLACED
    }

    fn name(&self) -> &str {
        "OrderPlacedHandler"
    }

    async fn handle(&self, message: &Value, _: &mut MessageHandlerContext) -> Result<()> {
        let event: OrderPlaced = serde_json::from_value(message.clone())?;
        info!(order = event.order, "order shipped");
        let _ = self.shipped.send(event.order);
        Ok(())
    }
}

pub async fn run_demo(args: DemoArgs, mut config: ConveyorConfig) -> Result<()> {
    let timeout = conveyor_config::parse_duration(&args.timeout)?;
    let name = config.endpoint.name.clone();
    config.endpoint.send_only = false;
    // self-subscription in message-driven mode goes through our own queue
    config
        .routing
        .publishers
        .entry(ORDER_PLACED.into())
        .or_insert_with(|| name.clone());

    let broker = InMemoryBroker::new();
    let failures = Arc::new(AtomicU32::new(0));
    let (shipped_tx, mut shipped) = mpsc::unbounded_channel();

    let mut endpoint = EndpointBuilder::new(config)
        .transport(Arc::new(InMemoryTransport::new(Arc::clone(&broker))))
        .message(MessageMetadata::command(PLACE_ORDER))
        .message(MessageMetadata::event(ORDER_PLACED))
        .handler(Arc::new(PlaceOrderHandler {
            attempted: DashSet::new(),
            failures: Arc::clone(&failures),
        }))
        .handler(Arc::new(OrderPlacedHandler {
            shipped: shipped_tx,
        }))
        .build()?;
    endpoint.start()?;

    let session = endpoint.session();
    session.subscribe(ORDER_PLACED).await?;
    // message-driven subscription requests are processed asynchronously
    tokio::time::sleep(Duration::from_millis(50)).await;

    for order in 1..=args.orders {
        session
            .send_local(PLACE_ORDER, &PlaceOrder { order }, SendOptions::new())
            .await
            .with_context(|| format!("sending order {order}"))?;
    }

    let mut completed = 0;
    let waited = tokio::time::timeout(timeout, async {
        while completed < args.orders && shipped.recv().await.is_some() {
            completed += 1;
        }
    })
    .await;
    if waited.is_err() {
        warn!(completed, expected = args.orders, "timed out waiting for orders");
    }

    let errored = broker.len(&error_queue(&endpoint));
    endpoint.stop().await;

    println!("endpoint:       {name}");
    println!("orders sent:    {}", args.orders);
    println!("orders shipped: {completed}");
    println!("failed attempts retried: {}", failures.load(Ordering::Relaxed));
    println!("in error queue: {errored}");
    Ok(())
}

fn error_queue(endpoint: &Endpoint) -> String {
    endpoint
        .settings()
        .get::<String>(keys::ERROR_QUEUE)
        .unwrap_or_else(|_| "error".into())
}
