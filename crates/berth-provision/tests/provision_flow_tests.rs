//! End-to-end provisioning flow over the in-memory store and fake panel.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use berth_core::{NodeId, OrderId, PlanId};
use berth_provision::allocation::PortBandPolicy;
use berth_provision::catalog::PlanCatalog;
use berth_provision::directory::AllocationDirectory;
use berth_provision::error::{Error, ProvisionErrorKind, Result};
use berth_provision::intake::{IntakeOutcome, OrderIntake, PaymentEvent, PROVISIONING_EVENT_TYPE};
use berth_provision::node::Node;
use berth_provision::order::{BillingTerm, Order, OrderStatus, TransitionReason};
use berth_provision::panel::fake::{CreateFailure, FakePanel};
use berth_provision::panel::PanelClient;
use berth_provision::provisioner::Provisioner;
use berth_provision::store::memory::InMemoryStore;
use berth_provision::store::Store;

struct Fleet {
    store: Arc<InMemoryStore>,
    panel: Arc<FakePanel>,
    provisioner: Arc<Provisioner>,
    intake: OrderIntake,
}

fn fleet() -> Fleet {
    let store = Arc::new(InMemoryStore::new());
    let panel = Arc::new(FakePanel::new());
    let directory = Arc::new(AllocationDirectory::new(
        panel.clone(),
        PortBandPolicy::default(),
    ));
    let provisioner = Arc::new(Provisioner::new(
        store.clone() as Arc<dyn Store>,
        panel.clone(),
        directory,
        Arc::new(PlanCatalog::builtin()),
    ));
    let intake = OrderIntake::new(store.clone() as Arc<dyn Store>, provisioner.clone());
    Fleet {
        store,
        panel,
        provisioner,
        intake,
    }
}

async fn register_node(
    fleet: &Fleet,
    id: u32,
    panel_id: u32,
    ip: IpAddr,
    max_gb: u32,
    ports: &[u16],
) -> Result<Node> {
    let node = Node::new(
        NodeId::new(id),
        format!("node-{id:02}"),
        "us-east",
        panel_id,
        ip,
        max_gb,
        2,
    );
    fleet.store.upsert_node(&node).await?;
    fleet.panel.add_node(panel_id, node.name.clone(), max_gb * 1024)?;
    fleet.panel.seed_allocations(panel_id, ip, ports)?;
    Ok(node)
}

fn checkout_event(subscription: &str, plan: &str) -> PaymentEvent {
    PaymentEvent {
        event_id: format!("evt_{subscription}"),
        event_type: PROVISIONING_EVENT_TYPE.to_string(),
        subscription_id: subscription.to_string(),
        user_id: "user_42".to_string(),
        plan_id: PlanId::new(plan),
        region: "us-east".to_string(),
        server_name: "my server".to_string(),
        term: BillingTerm::Monthly,
    }
}

async fn paid_order(fleet: &Fleet, subscription: &str, plan: &str) -> Result<Order> {
    let mut order = Order::new(
        "user_42",
        PlanId::new(plan),
        "us-east",
        "my server",
        BillingTerm::Monthly,
        subscription,
    );
    order.transition_to(OrderStatus::Paid, TransitionReason::PaymentReceived)?;
    fleet.store.save_order(&order).await?;
    Ok(order)
}

/// Waits out the spawned provisioning task kicked off by intake.
async fn wait_for_status(
    store: &InMemoryStore,
    order_id: &OrderId,
    status: OrderStatus,
) -> Result<Order> {
    for _ in 0..200 {
        if let Some(order) = store.get_order(order_id).await? {
            if order.status == status {
                return Ok(order);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Err(Error::storage(format!("order never reached {status}")))
}

/// A paid 4 GB checkout lands on a node with exactly 4096 MB usable and
/// comes back with the allocation's address. The node ends up full.
#[tokio::test]
async fn checkout_provisions_to_a_connection_address() -> Result<()> {
    let fleet = fleet();
    let ip: IpAddr = "1.2.3.4".parse().expect("ip");
    register_node(&fleet, 1, 7, ip, 6, &[25565]).await?;

    let outcome = fleet
        .intake
        .ingest(checkout_event("sub_e2e", "mc-java-4gb"))
        .await?;
    let order = match outcome {
        IntakeOutcome::Accepted { order } => order,
        other => panic!("expected Accepted, got {other:?}"),
    };

    let placed = wait_for_status(&fleet.store, &order.id, OrderStatus::Provisioned).await?;
    assert_eq!(placed.node_id, Some(NodeId::new(1)));
    assert!(placed.pterodactyl_server_id.is_some());

    let instance = fleet
        .store
        .find_live_instance(&order.id)
        .await?
        .expect("live instance");
    assert_eq!(instance.address().as_deref(), Some("1.2.3.4:25565"));

    let snapshot = fleet.store.capacity_snapshot("us-east").await?;
    assert_eq!(snapshot[0].available_mb, 0);

    let server = fleet
        .panel
        .get_server_by_external_id(&placed.external_tag())
        .await?
        .expect("server tagged for the order");
    assert_eq!(Some(server.id), placed.pterodactyl_server_id);
    Ok(())
}

/// Webhook redelivery after the first attempt finished must not create a
/// second server or a second order.
#[tokio::test]
async fn redelivered_checkout_is_a_no_op() -> Result<()> {
    let fleet = fleet();
    let ip: IpAddr = "1.2.3.4".parse().expect("ip");
    register_node(&fleet, 1, 7, ip, 10, &[25565, 25566]).await?;

    let first = fleet
        .intake
        .ingest(checkout_event("sub_dup", "mc-java-2gb"))
        .await?;
    let order_id = first.order().expect("accepted order").id;
    wait_for_status(&fleet.store, &order_id, OrderStatus::Provisioned).await?;

    let second = fleet
        .intake
        .ingest(checkout_event("sub_dup", "mc-java-2gb"))
        .await?;
    match second {
        IntakeOutcome::Duplicate { order } => {
            assert_eq!(order.id, order_id);
            assert_eq!(order.status, OrderStatus::Provisioned);
        }
        other => panic!("expected Duplicate, got {other:?}"),
    }
    assert_eq!(fleet.store.order_count()?, 1);
    assert_eq!(fleet.panel.create_calls()?, 1);
    assert_eq!(fleet.panel.server_count()?, 1);
    Ok(())
}

/// Placement prefers the fullest node that still fits, leaving headroom on
/// the bigger boxes for bigger plans.
#[tokio::test]
async fn placement_packs_the_tightest_node_first() -> Result<()> {
    let fleet = fleet();
    register_node(&fleet, 1, 7, "10.0.0.1".parse().expect("ip"), 10, &[25565]).await?;
    register_node(&fleet, 2, 8, "10.0.0.2".parse().expect("ip"), 6, &[25565]).await?;
    register_node(&fleet, 3, 9, "10.0.0.3".parse().expect("ip"), 8, &[25565]).await?;

    let first = paid_order(&fleet, "sub_fit_a", "mc-java-4gb").await?;
    let receipt = fleet
        .provisioner
        .provision(first.id)
        .await
        .expect("first placement");
    assert_eq!(receipt.node_id, NodeId::new(2));

    // Node 2 is now full, so the 6144 MB node is the tightest fit left.
    let second = paid_order(&fleet, "sub_fit_b", "mc-java-4gb").await?;
    let receipt = fleet
        .provisioner
        .provision(second.id)
        .await
        .expect("second placement");
    assert_eq!(receipt.node_id, NodeId::new(3));
    Ok(())
}

/// A persistently failing panel burns through the attempt cap; the order
/// parks in `ERROR` for an operator instead of retrying forever.
#[tokio::test]
async fn panel_outage_exhausts_the_attempt_cap() -> Result<()> {
    let fleet = fleet();
    let ip: IpAddr = "1.2.3.4".parse().expect("ip");
    register_node(&fleet, 1, 7, ip, 10, &[25565]).await?;

    let order = paid_order(&fleet, "sub_cap", "mc-java-2gb").await?;
    for _ in 0..3 {
        fleet.panel.fail_next_create(CreateFailure::Status(500))?;
    }

    fleet
        .provisioner
        .provision(order.id)
        .await
        .expect_err("first attempt fails");
    for _ in 0..2 {
        fleet
            .provisioner
            .retry(order.id, TransitionReason::ReconcilerRetry)
            .await
            .expect_err("retry fails");
    }

    let parked = fleet.store.get_order(&order.id).await?.expect("order exists");
    assert_eq!(parked.status, OrderStatus::Error);
    assert_eq!(parked.attempts, parked.max_attempts);
    assert!(!parked.can_retry());
    let failure = parked.last_error.expect("failure recorded");
    assert_eq!(failure.kind, ProvisionErrorKind::RemoteCall);
    assert!(failure.is_retryable());
    assert_eq!(fleet.panel.server_count()?, 0);
    Ok(())
}

/// An order pointing at a plan the catalog no longer sells fails closed on
/// the first attempt; no capacity is held and nothing is created.
#[tokio::test]
async fn unknown_plan_fails_terminally() -> Result<()> {
    let fleet = fleet();
    let ip: IpAddr = "1.2.3.4".parse().expect("ip");
    register_node(&fleet, 1, 7, ip, 10, &[25565]).await?;

    let order = paid_order(&fleet, "sub_plan", "mc-java-3gb").await?;
    let failure = fleet
        .provisioner
        .provision(order.id)
        .await
        .expect_err("plan is unknown");
    assert_eq!(failure.kind, ProvisionErrorKind::PlanConfig);
    assert!(!failure.is_retryable());

    let parked = fleet.store.get_order(&order.id).await?.expect("order exists");
    assert_eq!(parked.status, OrderStatus::Error);
    assert!(!parked.can_retry());
    assert_eq!(fleet.store.instance_count()?, 0);
    assert_eq!(fleet.panel.create_calls()?, 0);
    Ok(())
}

/// A region with no room fails transient; capacity added later lets the
/// same order land on retry.
#[tokio::test]
async fn full_region_recovers_when_capacity_appears() -> Result<()> {
    let fleet = fleet();
    register_node(&fleet, 1, 7, "10.0.0.1".parse().expect("ip"), 3, &[25565]).await?;

    let order = paid_order(&fleet, "sub_full", "mc-java-4gb").await?;
    let failure = fleet
        .provisioner
        .provision(order.id)
        .await
        .expect_err("nothing fits");
    assert_eq!(failure.kind, ProvisionErrorKind::NodeCapacity);
    assert!(failure.is_retryable());
    assert_eq!(fleet.store.instance_count()?, 0);

    register_node(&fleet, 2, 8, "10.0.0.2".parse().expect("ip"), 8, &[25566]).await?;
    let receipt = fleet
        .provisioner
        .retry(order.id, TransitionReason::ManualRetry)
        .await
        .expect("capacity appeared");
    assert_eq!(receipt.node_id, NodeId::new(2));

    let placed = fleet.store.get_order(&order.id).await?.expect("order exists");
    assert_eq!(placed.status, OrderStatus::Provisioned);
    assert_eq!(
        placed.last_transition_reason,
        Some(TransitionReason::ProvisioningSucceeded)
    );
    Ok(())
}
