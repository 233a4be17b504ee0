//! Mapping from wire frames to consumer events.
//!
//! The router is a pure function over (access mode, envelope). It owns two
//! policies: the routing table from backend message types to `ClientEvent`
//! variants, and the public-mode filter that runs over every produced event
//! before any handler can see it. The filter is authoritative: full order
//! records and monetary detail never reach a public-mode consumer, even
//! when the backend mistakenly includes them.

use tracing::{debug, warn};

use crate::events::ClientEvent;
use crate::model::{AccessMode, Order, PublicOrderData};
use crate::protocol::{AdminOrderUpdate, Envelope, ErrorPayload};

/// Route one inbound frame. Returns the events to deliver, in order.
///
/// `connection_established` and `pong` are handled by the connection manager
/// before routing and produce no events here. Unknown types are logged and
/// dropped so that new backend message types never break existing clients.
pub fn route(mode: AccessMode, envelope: &Envelope) -> Vec<ClientEvent> {
    let result = match envelope.kind.as_str() {
        "connection_established" | "pong" => Ok(Vec::new()),

        "subscription_confirmed" => envelope
            .decode()
            .map(|p| vec![ClientEvent::SubscriptionConfirmed(p)]),

        "order_initial_data" => envelope
            .decode()
            .map(|p| vec![ClientEvent::OrderInitialData(p)]),

        "order_status_update" => envelope
            .decode()
            .map(|p| vec![ClientEvent::OrderStatusUpdate(p)]),

        "order_payment_update" => envelope
            .decode()
            .map(|p| vec![ClientEvent::OrderPaymentUpdate(p)]),

        "order_production_update" => envelope
            .decode()
            .map(|p| vec![ClientEvent::OrderProductionUpdate(p)]),

        "order_details_response" => envelope
            .decode()
            .map(|p| vec![ClientEvent::OrderDetails(p)]),

        "order_created" => envelope.decode().map(|p| vec![ClientEvent::OrderCreated(p)]),
        "order_updated" => envelope.decode().map(|p| vec![ClientEvent::OrderUpdated(p)]),
        "order_deleted" => envelope.decode().map(|p| vec![ClientEvent::OrderDeleted(p)]),

        "system_notification" => envelope
            .decode()
            .map(|p| vec![ClientEvent::SystemNotification(p)]),

        "error" => envelope.decode().map(|p| vec![ClientEvent::SystemError(p)]),

        "admin_order_update" => envelope.decode().map(route_admin_update),

        other => {
            debug!(message_type = other, "unhandled message type, dropping");
            Ok(Vec::new())
        }
    };

    let events = match result {
        Ok(events) => events,
        Err(err) => {
            warn!(message_type = %envelope.kind, error = %err, "undecodable payload");
            vec![ClientEvent::SystemError(ErrorPayload {
                code: "decode_error".to_string(),
                message: err.to_string(),
                details: None,
            })]
        }
    };

    match mode {
        AccessMode::Admin => events,
        AccessMode::Public => events.into_iter().filter_map(restrict_to_public).collect(),
    }
}

/// Public-mode policy, applied to every event the table produced.
/// Admin-only order events are suppressed outright; payloads that can carry
/// a full record get it stripped and replaced by the limited projection,
/// and monetary detail is blanked.
fn restrict_to_public(event: ClientEvent) -> Option<ClientEvent> {
    match event {
        ClientEvent::OrderCreated(_)
        | ClientEvent::OrderUpdated(_)
        | ClientEvent::OrderDeleted(_) => {
            warn!("admin-only order event suppressed in public mode");
            None
        }
        ClientEvent::OrderInitialData(mut p) => {
            sanitize(&mut p.order_data, &mut p.public_data);
            Some(ClientEvent::OrderInitialData(p))
        }
        ClientEvent::OrderStatusUpdate(mut p) => {
            sanitize(&mut p.order_data, &mut p.public_data);
            Some(ClientEvent::OrderStatusUpdate(p))
        }
        ClientEvent::OrderPaymentUpdate(mut p) => {
            sanitize(&mut p.order_data, &mut p.public_data);
            p.amount.clear();
            p.payment_type.clear();
            Some(ClientEvent::OrderPaymentUpdate(p))
        }
        ClientEvent::OrderProductionUpdate(mut p) => {
            sanitize(&mut p.order_data, &mut p.public_data);
            Some(ClientEvent::OrderProductionUpdate(p))
        }
        ClientEvent::OrderDetails(mut p) => {
            sanitize(&mut p.order_data, &mut p.public_data);
            Some(ClientEvent::OrderDetails(p))
        }
        other => Some(other),
    }
}

/// Dispatch the nested `update_type` of a consolidated admin frame through
/// the same table. Unrecognized nested kinds fall back to `order:updated`.
fn route_admin_update(update: AdminOrderUpdate) -> Vec<ClientEvent> {
    let AdminOrderUpdate {
        update_type,
        order_code,
        order_id,
        order,
        order_data,
        payment_type,
        amount,
        old_status,
        new_status,
        message,
        ..
    } = update;

    let record = order.or(order_data);

    match update_type.as_str() {
        "payment_updated" => vec![ClientEvent::OrderPaymentUpdate(crate::protocol::PaymentUpdate {
            order_code,
            order_id,
            payment_type,
            amount,
            order_data: record,
            public_data: None,
            message,
        })],
        "status_changed" => vec![ClientEvent::OrderStatusUpdate(crate::protocol::StatusUpdate {
            order_code,
            order_id,
            old_status,
            new_status,
            order_data: record,
            public_data: None,
            message,
        })],
        "production_updated" => {
            vec![ClientEvent::OrderProductionUpdate(crate::protocol::ProductionUpdate {
                order_code,
                order_id,
                old_status,
                new_status,
                order_data: record,
                public_data: None,
                message,
            })]
        }
        "order_created" => match record {
            Some(order) => vec![ClientEvent::OrderCreated(crate::protocol::OrderCreated {
                order,
                message,
            })],
            None => {
                warn!(%order_code, "admin create frame without order record");
                Vec::new()
            }
        },
        "order_deleted" => vec![ClientEvent::OrderDeleted(crate::protocol::OrderDeleted {
            order_id: order_id.unwrap_or_default(),
            order_code,
            message,
        })],
        // "order_updated" and anything the client does not recognize.
        other => {
            if other != "order_updated" {
                debug!(update_type = other, "unknown admin update kind, treating as order update");
            }
            match resolve_order(record, order_id, order_code) {
                Some(order) => vec![ClientEvent::OrderUpdated(crate::protocol::OrderUpdated {
                    order,
                    message,
                })],
                None => Vec::new(),
            }
        }
    }
}

/// Build the best available order record for a fallback update: the embedded
/// record when present, otherwise a stub carrying just the identity.
fn resolve_order(
    record: Option<Order>,
    order_id: Option<String>,
    order_code: String,
) -> Option<Order> {
    let candidate = record.unwrap_or_else(|| Order {
        order_code,
        ..Order::default()
    });
    let resolved = candidate.into_normalized(order_id.as_deref());
    if resolved.is_none() {
        warn!("admin update without order identity dropped");
    }
    resolved
}

/// Drop the full record and make sure a limited projection is present,
/// deriving it client-side when the backend only sent `order_data`.
fn sanitize(order_data: &mut Option<Order>, public_data: &mut Option<PublicOrderData>) {
    if let Some(order) = order_data.take() {
        if public_data.is_none() {
            *public_data = Some(order.public_projection());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, payload: serde_json::Value) -> Envelope {
        Envelope {
            kind: kind.to_string(),
            payload,
            timestamp: None,
        }
    }

    fn full_order_json(id: &str, code: &str) -> serde_json::Value {
        json!({
            "id": id,
            "order_code": code,
            "customer_name": "Budi",
            "product_name": "Kaos Sablon",
            "total_price": "500000",
            "paid_amount": "500000",
            "status_order": "lunas",
            "production_status": "belum_diproses"
        })
    }

    fn full_order_payload() -> serde_json::Value {
        json!({
            "order_code": "ORD-1",
            "order_id": 7,
            "old_status": "menunggu_link",
            "new_status": "lunas",
            "order_data": full_order_json("7", "ORD-1")
        })
    }

    #[test]
    fn public_mode_strips_order_data_and_synthesizes_public_projection() {
        let events = route(
            AccessMode::Public,
            &envelope("order_status_update", full_order_payload()),
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClientEvent::OrderStatusUpdate(update) => {
                assert!(update.order_data.is_none());
                let public = update.public_data.as_ref().expect("synthesized projection");
                assert_eq!(public.order_code, "ORD-1");
                assert_eq!(public.status_order, "lunas");
                let json = serde_json::to_value(public).unwrap();
                assert!(json.get("customer_name").is_none());
                assert!(json.get("total_price").is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn admin_mode_keeps_full_order_data() {
        let events = route(
            AccessMode::Admin,
            &envelope("order_status_update", full_order_payload()),
        );
        match &events[0] {
            ClientEvent::OrderStatusUpdate(update) => {
                let order = update.order_data.as_ref().expect("full record kept");
                assert_eq!(order.customer_name, "Budi");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn public_mode_blanks_payment_amounts() {
        let events = route(
            AccessMode::Public,
            &envelope(
                "order_payment_update",
                json!({ "order_code": "ORD-1", "payment_type": "dp", "amount": "250000" }),
            ),
        );
        match &events[0] {
            ClientEvent::OrderPaymentUpdate(update) => {
                assert!(update.amount.is_empty());
                assert!(update.payment_type.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn public_mode_suppresses_admin_only_order_events() {
        for kind in ["order_created", "order_updated"] {
            let events = route(
                AccessMode::Public,
                &envelope(kind, json!({ "order": full_order_json("7", "ORD-1") })),
            );
            assert!(events.is_empty(), "{kind} must not reach public consumers");
        }
        let events = route(
            AccessMode::Public,
            &envelope(
                "order_deleted",
                json!({ "order_id": "7", "order_code": "ORD-1" }),
            ),
        );
        assert!(events.is_empty());

        // The same frames are delivered untouched in admin mode.
        let events = route(
            AccessMode::Admin,
            &envelope("order_created", json!({ "order": full_order_json("7", "ORD-1") })),
        );
        assert!(matches!(&events[0], ClientEvent::OrderCreated(p) if p.order.customer_name == "Budi"));
    }

    #[test]
    fn public_mode_sanitizes_consolidated_admin_frames() {
        let events = route(
            AccessMode::Public,
            &envelope(
                "admin_order_update",
                json!({
                    "update_type": "payment_updated",
                    "order_code": "ORD-1",
                    "order_id": 7,
                    "payment_type": "pelunasan",
                    "amount": "250000",
                    "order_data": full_order_json("7", "ORD-1")
                }),
            ),
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClientEvent::OrderPaymentUpdate(update) => {
                assert!(update.order_data.is_none());
                assert!(update.amount.is_empty());
                assert!(update.payment_type.is_empty());
                let public = update.public_data.as_ref().expect("projection present");
                assert_eq!(public.order_code, "ORD-1");
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Nested create/update/delete are admin-only like their top-level
        // counterparts.
        let events = route(
            AccessMode::Public,
            &envelope(
                "admin_order_update",
                json!({
                    "update_type": "order_created",
                    "order_code": "ORD-1",
                    "order_id": 7,
                    "order": full_order_json("7", "ORD-1")
                }),
            ),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn admin_update_dispatches_on_nested_kind() {
        let events = route(
            AccessMode::Admin,
            &envelope(
                "admin_order_update",
                json!({
                    "update_type": "payment_updated",
                    "order_code": "ORD-1",
                    "order_id": 7,
                    "payment_type": "pelunasan",
                    "amount": 250000
                }),
            ),
        );
        match &events[0] {
            ClientEvent::OrderPaymentUpdate(update) => {
                assert_eq!(update.amount, "250000");
                assert_eq!(update.order_id.as_deref(), Some("7"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_admin_update_kind_falls_back_to_order_updated() {
        let events = route(
            AccessMode::Admin,
            &envelope(
                "admin_order_update",
                json!({ "update_type": "mystery", "order_code": "ORD-9", "order_id": 9 }),
            ),
        );
        match &events[0] {
            ClientEvent::OrderUpdated(update) => {
                assert_eq!(update.order.id, "9");
                assert_eq!(update.order.order_code, "ORD-9");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_top_level_type_produces_no_events() {
        let events = route(
            AccessMode::Admin,
            &envelope("order_teleported", json!({ "order_code": "ORD-1" })),
        );
        assert!(events.is_empty());
    }
}
