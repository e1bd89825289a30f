//! Relayed Operations
//!
//! Static metadata describing every request/response pair the relay forwards
//! between mobile clients and store backends. All operations share one generic
//! correlation path; this table is the only per-operation knowledge the core has.

use serde_json::{json, Value};

/// Where the target store of a request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantSource {
    /// The store the client registered for.
    ClientBinding,
    /// The `store_code` field of the request itself (no registration needed).
    Payload,
}

/// Routing metadata of one relayed operation.
#[derive(Debug, PartialEq, Eq)]
pub struct OperationSpec {
    /// Operation type used to tag pending requests.
    pub name: &'static str,
    /// Event a client sends to start the operation.
    pub request_event: &'static str,
    /// Event forwarded to the store backend.
    pub backend_event: &'static str,
    /// Events a backend may answer with. The first one is preferred;
    /// the rest are legacy spellings.
    pub response_events: &'static [&'static str],
    /// Event delivered to the client (results and errors alike).
    pub client_event: &'static str,
    /// Field that disambiguates concurrent requests of the same type.
    pub key_field: Option<&'static str>,
    pub tenant_source: TenantSource,
    /// List field clients always index into; errors carry it empty.
    pub list_field: Option<&'static str>,
}

impl OperationSpec {
    /// Event a backend should use when answering this operation.
    pub fn primary_response_event(&self) -> &'static str {
        self.response_events[0]
    }

    /// Client-facing failure payload for this operation.
    pub fn error_payload(&self, error: impl std::fmt::Display) -> Value {
        let mut data = json!({ "success": false, "error": error.to_string() });
        if let Some(field) = self.list_field {
            data[field] = json!([]);
        }
        data
    }
}

macro_rules! op {
    ($name:literal, key = $key:expr) => {
        OperationSpec {
            name: $name,
            request_event: concat!("get_", $name),
            backend_event: concat!("get_", $name),
            response_events: &[concat!($name, "_response"), concat!($name, "_data")],
            client_event: concat!($name, "_data"),
            key_field: $key,
            tenant_source: TenantSource::ClientBinding,
            list_field: None,
        }
    };
    ($name:literal) => {
        op!($name, key = None)
    };
}

/// Every operation the relay knows how to correlate.
pub static OPERATIONS: &[OperationSpec] = &[
    op!("products"),
    op!("product_details", key = Some("np")),
    op!("clients"),
    op!("sales"),
    op!("sale_details", key = Some("sale_id")),
    op!("vendeurs"),
    op!("clients_list"),
    op!("treasury"),
    op!("fournisseurs"),
    op!("factures_achat"),
    op!("facture_achat_details"),
    op!("factures_vente"),
    op!("facture_vente_details", key = Some("facture_id")),
    OperationSpec {
        name: "usernames",
        request_event: "get_usernames",
        backend_event: "get_usernames_request",
        response_events: &["usernames_list_response"],
        client_event: "usernames_list",
        key_field: None,
        tenant_source: TenantSource::Payload,
        list_field: Some("usernames"),
    },
];

/// Look up the operation a client request event starts.
pub fn by_request_event(event: &str) -> Option<&'static OperationSpec> {
    OPERATIONS.iter().find(|op| op.request_event == event)
}

/// Look up the operation a backend response event answers.
pub fn by_response_event(event: &str) -> Option<&'static OperationSpec> {
    OPERATIONS
        .iter()
        .find(|op| op.response_events.contains(&event))
}

/// Look up the operation behind an event forwarded to a backend.
pub fn by_backend_event(event: &str) -> Option<&'static OperationSpec> {
    OPERATIONS.iter().find(|op| op.backend_event == event)
}

/// Look up an operation by its type name.
pub fn by_name(name: &str) -> Option<&'static OperationSpec> {
    OPERATIONS.iter().find(|op| op.name == name)
}
