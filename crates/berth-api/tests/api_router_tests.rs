//! Integration tests for the Berth HTTP surface.
//!
//! Every test drives the real router through `tower::ServiceExt::oneshot`
//! with its own in-memory store and fake panel, so webhook intake, order
//! status, and the admin routes are exercised end to end without sockets.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod helpers {
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use axum::Router;
    use axum::body::Body;
    use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
    use axum::http::{Method, Request, Response, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use berth_api::server::ServerBuilder;
    use berth_api::signature;
    use berth_core::{NodeId, OrderId, PlanId};
    use berth_provision::intake::{PROVISIONING_EVENT_TYPE, PaymentEvent};
    use berth_provision::node::Node;
    use berth_provision::order::{BillingTerm, Order, OrderStatus, TransitionReason};
    use berth_provision::panel::fake::FakePanel;
    use berth_provision::store::Store;
    use berth_provision::store::memory::InMemoryStore;

    pub const WEBHOOK_SECRET: &str = "whsec_router_tests";
    pub const ADMIN_TOKEN: &str = "admin_router_tests";

    /// The router under test plus handles on the fleet behind it.
    pub struct Harness {
        pub router: Router,
        pub store: Arc<InMemoryStore>,
        pub panel: Arc<FakePanel>,
    }

    /// Builds a router over a fresh in-memory fleet with both secrets set.
    pub fn harness() -> Result<Harness> {
        let store = Arc::new(InMemoryStore::new());
        let panel = Arc::new(FakePanel::new());
        let server = ServerBuilder::new()
            .webhook_secret(WEBHOOK_SECRET)
            .admin_token(ADMIN_TOKEN)
            .store(store.clone())
            .panel(panel.clone())
            .build();
        let router = server.test_router().context("build test router")?;
        Ok(Harness {
            router,
            store,
            panel,
        })
    }

    /// Builds a request with an optional JSON body.
    pub fn make_request(method: Method, uri: &str, body: Option<Value>) -> Result<Request<Body>> {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json)?))?,
            None => builder.body(Body::empty())?,
        };
        Ok(request)
    }

    /// Builds a request carrying the admin bearer token.
    pub fn admin_request(method: Method, uri: &str, body: Option<Value>) -> Result<Request<Body>> {
        let mut request = make_request(method, uri, body)?;
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {ADMIN_TOKEN}")
                .parse()
                .context("authorization header")?,
        );
        Ok(request)
    }

    /// Sends a request through the router.
    pub async fn send(router: &Router, request: Request<Body>) -> Result<Response<Body>> {
        let response = router
            .clone()
            .oneshot(request)
            .await
            .map_err(|err| -> anyhow::Error { match err {} })?;
        Ok(response)
    }

    /// Sends a request and decodes the JSON body, keeping the status.
    pub async fn send_json(router: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
        let response = send(router, request).await?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .context("read response body")?
            .to_bytes();
        let body: Value = serde_json::from_slice(&bytes).with_context(|| {
            format!(
                "non-JSON response (status {status}): {}",
                String::from_utf8_lossy(&bytes)
            )
        })?;
        Ok((status, body))
    }

    /// Posts a billing event signed with the harness secret.
    pub async fn post_signed_event(
        router: &Router,
        event: &PaymentEvent,
    ) -> Result<(StatusCode, Value)> {
        let body = serde_json::to_vec(event).context("serialize event")?;
        post_signed_bytes(router, WEBHOOK_SECRET, body).await
    }

    /// Posts raw bytes to the webhook, signed with the given secret.
    pub async fn post_signed_bytes(
        router: &Router,
        secret: &str,
        body: Vec<u8>,
    ) -> Result<(StatusCode, Value)> {
        let digest = signature::sign(secret, &body).context("sign body")?;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/billing")
            .header(CONTENT_TYPE, "application/json")
            .header(signature::SIGNATURE_HEADER, digest)
            .body(Body::from(body))?;
        send_json(router, request).await
    }

    /// Registers a node in the store and on the panel with seeded ports.
    pub async fn register_node(
        h: &Harness,
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
        h.store.upsert_node(&node).await.context("upsert node")?;
        h.panel
            .add_node(panel_id, node.name.clone(), max_gb * 1024)
            .context("panel node")?;
        h.panel
            .seed_allocations(panel_id, ip, ports)
            .context("panel allocations")?;
        Ok(node)
    }

    /// A checkout completion for one subscription.
    pub fn checkout_event(subscription: &str, plan: &str) -> PaymentEvent {
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

    /// Saves a `PAID` order directly, as if the webhook already landed.
    pub async fn paid_order(h: &Harness, subscription: &str, plan: &str) -> Result<Order> {
        let mut order = Order::new(
            "user_42",
            PlanId::new(plan),
            "us-east",
            "my server",
            BillingTerm::Monthly,
            subscription,
        );
        order
            .transition_to(OrderStatus::Paid, TransitionReason::PaymentReceived)
            .context("mark paid")?;
        h.store.save_order(&order).await.context("save order")?;
        Ok(order)
    }

    /// Waits out the provisioning task spawned by webhook intake.
    pub async fn wait_for_status(
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
        anyhow::bail!("order {order_id} never reached {status}")
    }
}

mod webhooks {
    use anyhow::{Context, Result};
    use axum::http::{Method, StatusCode};
    use berth_provision::order::OrderStatus;

    use super::helpers::{
        self, WEBHOOK_SECRET, checkout_event, harness, make_request, post_signed_bytes,
        post_signed_event, register_node, send_json, wait_for_status,
    };

    #[tokio::test]
    async fn signed_checkout_lands_a_server() -> Result<()> {
        let h = harness()?;
        register_node(&h, 1, 7, "1.2.3.4".parse()?, 6, &[25565]).await?;

        let (status, ack) =
            post_signed_event(&h.router, &checkout_event("sub_hook", "mc-java-4gb")).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["duplicate"], false);
        assert_eq!(ack["status"], "PAID");

        let order_id = ack["order_id"]
            .as_str()
            .context("ack carries an order id")?
            .parse()?;
        wait_for_status(&h.store, &order_id, OrderStatus::Provisioned).await?;
        assert_eq!(h.panel.server_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn redelivery_acks_duplicate_without_a_second_server() -> Result<()> {
        let h = harness()?;
        register_node(&h, 1, 7, "1.2.3.4".parse()?, 10, &[25565, 25566]).await?;

        let (_, first) =
            post_signed_event(&h.router, &checkout_event("sub_dup", "mc-java-2gb")).await?;
        let order_id = first["order_id"]
            .as_str()
            .context("ack carries an order id")?
            .parse()?;
        wait_for_status(&h.store, &order_id, OrderStatus::Provisioned).await?;

        let (status, second) =
            post_signed_event(&h.router, &checkout_event("sub_dup", "mc-java-2gb")).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["duplicate"], true);
        assert_eq!(second["order_id"], first["order_id"]);
        assert_eq!(second["status"], "PROVISIONED");

        assert_eq!(h.store.order_count()?, 1);
        assert_eq!(h.panel.create_calls()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() -> Result<()> {
        let h = harness()?;
        let body = serde_json::to_vec(&checkout_event("sub_forged", "mc-java-2gb"))?;

        let (status, error) = post_signed_bytes(&h.router, "whsec_other", body).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error["code"], "INVALID_SIGNATURE");
        assert_eq!(h.store.order_count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_signature_is_rejected() -> Result<()> {
        let h = harness()?;
        let event = serde_json::to_value(checkout_event("sub_unsigned", "mc-java-2gb"))?;

        let request = make_request(Method::POST, "/webhooks/billing", Some(event))?;
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error["code"], "INVALID_SIGNATURE");
        assert_eq!(h.store.order_count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_payload_is_unprocessable() -> Result<()> {
        let h = harness()?;

        let (status, error) =
            post_signed_bytes(&h.router, WEBHOOK_SECRET, b"{not json".to_vec()).await?;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error["code"], "INVALID_PAYLOAD");
        Ok(())
    }

    #[tokio::test]
    async fn incomplete_event_is_unprocessable() -> Result<()> {
        let h = harness()?;
        let mut event = checkout_event("sub_incomplete", "mc-java-2gb");
        event.subscription_id = String::new();

        let (status, error) = post_signed_event(&h.router, &event).await?;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error["code"], "INVALID_EVENT");
        assert_eq!(h.store.order_count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn unrelated_event_type_is_acked_and_ignored() -> Result<()> {
        let h = harness()?;
        let mut event = checkout_event("sub_renewal", "mc-java-2gb");
        event.event_type = "invoice.payment_succeeded".to_string();

        let (status, ack) = post_signed_event(&h.router, &event).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["duplicate"], false);
        assert_eq!(ack["ignored_event_type"], "invoice.payment_succeeded");
        assert!(ack.get("order_id").is_none());
        assert_eq!(h.store.order_count()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn acks_carry_the_request_id_header() -> Result<()> {
        let h = harness()?;
        let body = serde_json::to_vec(&checkout_event("sub_traced", "mc-java-2gb"))?;
        let digest = berth_api::signature::sign(WEBHOOK_SECRET, &body)?;

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/webhooks/billing")
            .header("content-type", "application/json")
            .header(berth_api::signature::SIGNATURE_HEADER, digest)
            .header("x-request-id", "req-hook-1")
            .body(axum::body::Body::from(body))?;
        let response = helpers::send(&h.router, request).await?;

        assert_eq!(
            response
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok()),
            Some("req-hook-1")
        );
        Ok(())
    }
}

mod orders {
    use anyhow::{Context, Result};
    use axum::http::{Method, StatusCode};
    use berth_provision::error::{ProvisionError, ProvisionErrorKind};
    use berth_provision::order::{OrderStatus, TransitionReason};
    use berth_provision::store::Store;

    use super::helpers::{
        checkout_event, harness, make_request, paid_order, post_signed_event, register_node,
        send_json, wait_for_status,
    };

    #[tokio::test]
    async fn unknown_order_is_not_found() -> Result<()> {
        let h = harness()?;

        let request = make_request(Method::GET, "/orders/01ARZ3NDEKTSV4RRFFQ69G5FAV", None)?;
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["code"], "NOT_FOUND");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_order_id_is_bad_request() -> Result<()> {
        let h = harness()?;

        let request = make_request(Method::GET, "/orders/not-a-ulid", None)?;
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["code"], "BAD_REQUEST");
        Ok(())
    }

    #[tokio::test]
    async fn paid_order_reads_in_progress() -> Result<()> {
        let h = harness()?;
        let order = paid_order(&h, "sub_waiting", "mc-java-2gb").await?;

        let request = make_request(Method::GET, &format!("/orders/{}", order.id), None)?;
        let (status, view) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["setup_state"], "in_progress");
        assert_eq!(view["server_name"], "my server");
        assert_eq!(view["region"], "us-east");
        assert!(view.get("address").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn provisioned_order_reads_ready_with_its_address() -> Result<()> {
        let h = harness()?;
        register_node(&h, 1, 7, "1.2.3.4".parse()?, 6, &[25565]).await?;

        let (_, ack) =
            post_signed_event(&h.router, &checkout_event("sub_ready", "mc-java-4gb")).await?;
        let order_id = ack["order_id"]
            .as_str()
            .context("ack carries an order id")?
            .parse()?;
        wait_for_status(&h.store, &order_id, OrderStatus::Provisioned).await?;

        let request = make_request(Method::GET, &format!("/orders/{order_id}"), None)?;
        let (status, view) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["setup_state"], "ready");
        assert_eq!(view["address"], "1.2.3.4:25565");
        Ok(())
    }

    /// A parked order reads `attention`, and the recorded panel failure
    /// never reaches the storefront body.
    #[tokio::test]
    async fn exhausted_order_reads_attention_without_detail() -> Result<()> {
        let h = harness()?;
        let mut order = paid_order(&h, "sub_parked", "mc-java-2gb").await?;
        for _ in 0..order.max_attempts {
            order.transition_to(OrderStatus::Provisioning, TransitionReason::ProvisioningStarted)?;
            order.record_failure(ProvisionError::new(
                ProvisionErrorKind::RemoteCall,
                "node wings-03.internal refused egg 17: disk full",
            ))?;
        }
        assert!(!order.can_retry());
        h.store.save_order(&order).await?;

        let request = make_request(Method::GET, &format!("/orders/{}", order.id), None)?;
        let (status, view) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["setup_state"], "attention");
        assert!(!view.to_string().contains("wings-03"));
        Ok(())
    }

    /// An error with retries left still reads `in_progress`: the reconciler
    /// will pick the order up again, so there is nothing for the customer
    /// to act on yet.
    #[tokio::test]
    async fn retryable_error_reads_in_progress() -> Result<()> {
        let h = harness()?;
        let mut order = paid_order(&h, "sub_retrying", "mc-java-2gb").await?;
        order.transition_to(OrderStatus::Provisioning, TransitionReason::ProvisioningStarted)?;
        order.record_failure(ProvisionError::new(
            ProvisionErrorKind::NodeCapacity,
            "region us-east has no node with 2048 MB free",
        ))?;
        assert!(order.can_retry());
        h.store.save_order(&order).await?;

        let request = make_request(Method::GET, &format!("/orders/{}", order.id), None)?;
        let (status, view) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["setup_state"], "in_progress");
        Ok(())
    }
}

mod admin {
    use anyhow::{Context, Result};
    use axum::http::header::AUTHORIZATION;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use berth_core::NodeId;
    use berth_provision::node::Node;
    use berth_provision::order::OrderStatus;
    use berth_provision::panel::{PanelClient, PowerSignal};
    use berth_provision::store::Store;

    use super::helpers::{
        admin_request, checkout_event, harness, make_request, paid_order, post_signed_event,
        register_node, send, send_json, wait_for_status,
    };

    #[tokio::test]
    async fn admin_routes_reject_missing_token() -> Result<()> {
        let h = harness()?;

        let request = make_request(Method::GET, "/admin/nodes", None)?;
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error["code"], "MISSING_AUTH");
        Ok(())
    }

    #[tokio::test]
    async fn admin_routes_reject_wrong_token() -> Result<()> {
        let h = harness()?;

        let mut request = make_request(Method::GET, "/admin/nodes", None)?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, "Bearer nope".parse()?);
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error["code"], "UNAUTHORIZED");
        Ok(())
    }

    /// Power passthrough changes machine state, so it sits behind the same
    /// bearer token as the rest of the operator surface.
    #[tokio::test]
    async fn power_route_requires_the_admin_token() -> Result<()> {
        let h = harness()?;

        let request = make_request(
            Method::POST,
            "/servers/abcd1234/power",
            Some(json!({"signal": "start"})),
        )?;
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error["code"], "MISSING_AUTH");
        Ok(())
    }

    #[tokio::test]
    async fn node_listing_reports_capacity_usage() -> Result<()> {
        let h = harness()?;
        register_node(&h, 1, 7, "1.2.3.4".parse()?, 10, &[25565, 25566]).await?;

        let (_, ack) =
            post_signed_event(&h.router, &checkout_event("sub_cap", "mc-java-2gb")).await?;
        let order_id = ack["order_id"]
            .as_str()
            .context("ack carries an order id")?
            .parse()?;
        wait_for_status(&h.store, &order_id, OrderStatus::Provisioned).await?;

        let request = admin_request(Method::GET, "/admin/nodes", None)?;
        let (status, body) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::OK);

        let node = &body["nodes"][0];
        assert_eq!(node["id"], 1);
        assert_eq!(node["enabled"], true);
        assert_eq!(node["usable_mb"], 8192);
        assert_eq!(node["used_mb"], 2048);
        assert_eq!(node["available_mb"], 6144);
        Ok(())
    }

    #[tokio::test]
    async fn allocation_reset_refuses_an_enabled_node() -> Result<()> {
        let h = harness()?;
        register_node(&h, 1, 7, "1.2.3.4".parse()?, 10, &[25565]).await?;

        let request = admin_request(Method::POST, "/admin/nodes/1/allocations/reset", None)?;
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["code"], "CONFLICT");
        Ok(())
    }

    #[tokio::test]
    async fn allocation_reset_rebuilds_a_disabled_node_pool() -> Result<()> {
        let h = harness()?;
        let ip: std::net::IpAddr = "1.2.3.4".parse()?;
        let mut node = Node::new(NodeId::new(1), "node-01", "us-east", 7, ip, 10, 2);
        node.enabled = false;
        h.store.upsert_node(&node).await?;
        h.panel.add_node(7, "node-01", 10 * 1024)?;
        // 25565 is inside the Java band; 9999 is outside every band.
        h.panel.seed_allocations(7, ip, &[25565, 9999])?;

        let request = admin_request(Method::POST, "/admin/nodes/1/allocations/reset", None)?;
        let (status, reset) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reset["deleted"], 1);
        assert_eq!(reset["kept"], 1);
        assert_eq!(reset["skipped_assigned"], 0);
        assert!(reset["created"].as_u64().context("created count")? > 0);

        let pool = h.panel.list_allocations(7).await?;
        assert!(pool.iter().all(|endpoint| endpoint.port != 9999));
        Ok(())
    }

    #[tokio::test]
    async fn retry_of_an_unknown_order_is_not_found() -> Result<()> {
        let h = harness()?;

        let request = admin_request(
            Method::POST,
            "/admin/orders/01ARZ3NDEKTSV4RRFFQ69G5FAV/retry",
            None,
        )?;
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["code"], "NOT_FOUND");
        Ok(())
    }

    #[tokio::test]
    async fn retry_of_a_provisioned_order_is_a_conflict() -> Result<()> {
        let h = harness()?;
        register_node(&h, 1, 7, "1.2.3.4".parse()?, 10, &[25565]).await?;

        let (_, ack) =
            post_signed_event(&h.router, &checkout_event("sub_done", "mc-java-2gb")).await?;
        let order_id = ack["order_id"]
            .as_str()
            .context("ack carries an order id")?
            .parse::<berth_core::OrderId>()?;
        wait_for_status(&h.store, &order_id, OrderStatus::Provisioned).await?;

        let request = admin_request(Method::POST, &format!("/admin/orders/{order_id}/retry"), None)?;
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(
            error["message"]
                .as_str()
                .context("conflict message")?
                .contains("PROVISIONED")
        );
        Ok(())
    }

    /// A checkout that failed for lack of capacity parks in `ERROR`; once a
    /// node appears, the admin retry drives it to a placed server inline
    /// and returns the receipt.
    #[tokio::test]
    async fn retry_provisions_a_parked_order_once_capacity_appears() -> Result<()> {
        let h = harness()?;

        let (_, ack) =
            post_signed_event(&h.router, &checkout_event("sub_parked", "mc-java-4gb")).await?;
        let order_id = ack["order_id"]
            .as_str()
            .context("ack carries an order id")?
            .parse()?;
        wait_for_status(&h.store, &order_id, OrderStatus::Error).await?;

        register_node(&h, 1, 7, "1.2.3.4".parse()?, 6, &[25565]).await?;

        let request = admin_request(Method::POST, &format!("/admin/orders/{order_id}/retry"), None)?;
        let (status, receipt) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["order_id"], order_id.to_string());
        assert_eq!(receipt["node_id"], 1);
        assert_eq!(receipt["address"], "1.2.3.4:25565");
        assert_eq!(receipt["adopted"], false);

        let order_request = make_request(Method::GET, &format!("/orders/{order_id}"), None)?;
        let (status, view) = send_json(&h.router, order_request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["setup_state"], "ready");
        Ok(())
    }

    /// Retry also unsticks a `PAID` order whose spawned attempt never ran,
    /// e.g. after a crash between intake and provisioning.
    #[tokio::test]
    async fn retry_picks_up_a_stalled_paid_order() -> Result<()> {
        let h = harness()?;
        register_node(&h, 1, 7, "1.2.3.4".parse()?, 10, &[25565]).await?;
        let order = paid_order(&h, "sub_stalled", "mc-java-2gb").await?;

        let request = admin_request(Method::POST, &format!("/admin/orders/{}/retry", order.id), None)?;
        let (status, receipt) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["node_id"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn power_signal_reaches_the_panel() -> Result<()> {
        let h = harness()?;
        register_node(&h, 1, 7, "1.2.3.4".parse()?, 10, &[25565]).await?;

        let (_, ack) =
            post_signed_event(&h.router, &checkout_event("sub_power", "mc-java-2gb")).await?;
        let order_id = ack["order_id"]
            .as_str()
            .context("ack carries an order id")?
            .parse()?;
        wait_for_status(&h.store, &order_id, OrderStatus::Provisioned).await?;

        let instance = h
            .store
            .find_live_instance(&order_id)
            .await?
            .context("live instance")?;
        let identifier = instance.remote.context("remote identity")?.identifier;

        let request = admin_request(
            Method::POST,
            &format!("/servers/{identifier}/power"),
            Some(json!({"signal": "start"})),
        )?;
        let response = send(&h.router, request).await?;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let signals = h.panel.power_signals()?;
        assert_eq!(signals, vec![(identifier, PowerSignal::Start)]);
        Ok(())
    }

    /// The panel's own error detail stays opaque through the power route.
    #[tokio::test]
    async fn power_to_an_unknown_server_maps_to_upstream_error() -> Result<()> {
        let h = harness()?;

        let request = admin_request(
            Method::POST,
            "/servers/ghost123/power",
            Some(json!({"signal": "stop"})),
        )?;
        let (status, error) = send_json(&h.router, request).await?;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(error["code"], "UPSTREAM_PANEL");
        assert!(
            !error["message"]
                .as_str()
                .context("error message")?
                .contains("ghost123")
        );
        Ok(())
    }
}

mod observability {
    use anyhow::{Context, Result};
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;

    use super::helpers::{harness, make_request, send, send_json};

    #[tokio::test]
    async fn health_and_ready_answer_without_auth() -> Result<()> {
        let h = harness()?;

        let (status, body) = send_json(&h.router, make_request(Method::GET, "/health", None)?).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send_json(&h.router, make_request(Method::GET, "/ready", None)?).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        Ok(())
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_request_counters() -> Result<()> {
        berth_api::metrics::init_metrics();
        let h = harness()?;

        // One request through the stack so the counters exist.
        let response = send(&h.router, make_request(Method::GET, "/health", None)?).await?;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&h.router, make_request(Method::GET, "/metrics", None)?).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response
            .into_body()
            .collect()
            .await
            .context("read metrics body")?
            .to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("berth_api_request_total"));
        Ok(())
    }
}
