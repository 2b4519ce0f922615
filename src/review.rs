//! Decoding of inbound `AdmissionReview` envelopes and construction of the
//! responses that go back in the same envelope.

use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::{DynamicObject, TypeMeta};
use serde_json::{Value, json};
use thiserror::Error;

pub const ADMISSION_GROUP: &str = "admission.k8s.io";
pub const REVIEW_KIND: &str = "AdmissionReview";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("request body is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error(
        "expected an AdmissionReview in group admission.k8s.io, \
         got apiVersion '{api_version}' kind '{kind}'"
    )]
    Envelope { api_version: String, kind: String },
    #[error("malformed admission request: {0}")]
    Request(#[source] serde_json::Error),
    #[error("AdmissionReview carries no request")]
    MissingRequest,
    #[error("{operation} admission request '{uid}' carries no object")]
    MissingObject { uid: String, operation: String },
}

/// Whatever could be read from a body that failed to decode, so the failure
/// response can still be correlated by the API server.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ObservedEnvelope {
    pub uid: Option<String>,
    pub types: Option<TypeMeta>,
}

pub fn decode(body: &[u8]) -> Result<AdmissionRequest<DynamicObject>, DecodeError> {
    let mut value: Value = serde_json::from_slice(body).map_err(DecodeError::Json)?;
    envelope_types(&value)?;
    fill_unread_request_fields(&mut value);

    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(value).map_err(DecodeError::Request)?;
    let request: AdmissionRequest<DynamicObject> = review
        .try_into()
        .map_err(|_| DecodeError::MissingRequest)?;

    if request.object.is_none() && requires_object(&request.operation) {
        return Err(DecodeError::MissingObject {
            uid: request.uid.clone(),
            operation: operation_name(&request.operation),
        });
    }

    Ok(request)
}

pub fn observe_envelope(body: &[u8]) -> ObservedEnvelope {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return ObservedEnvelope::default();
    };
    ObservedEnvelope {
        uid: value
            .pointer("/request/uid")
            .and_then(Value::as_str)
            .map(str::to_owned),
        types: envelope_types(&value).ok(),
    }
}

/// `allowed=false` with the decode error as status message. The uid and
/// envelope version are echoed whenever they were readable.
pub fn failure_response(observed: &ObservedEnvelope, err: &DecodeError) -> AdmissionResponse {
    let mut response = AdmissionResponse::invalid(err.to_string());
    if let Some(uid) = &observed.uid {
        response.uid = uid.clone();
    }
    if let Some(types) = &observed.types {
        response.types = types.clone();
    }
    response
}

pub fn operation_name(operation: &Operation) -> String {
    format!("{operation:?}").to_uppercase()
}

fn requires_object(operation: &Operation) -> bool {
    matches!(operation, Operation::Create | Operation::Update)
}

/// `userInfo`, `resource` and `dryRun` are required by the typed request but
/// never read here, so a review that omits them still decodes.
fn fill_unread_request_fields(value: &mut Value) {
    let Some(request) = value.get_mut("request").and_then(Value::as_object_mut) else {
        return;
    };
    request.entry("userInfo").or_insert_with(|| json!({}));
    request.entry("dryRun").or_insert(Value::Bool(false));
    if !request.contains_key("resource") {
        if let Some(kind) = request.get("kind") {
            let resource = json!({
                "group": kind.get("group").cloned().unwrap_or(Value::Null),
                "version": kind.get("version").cloned().unwrap_or(Value::Null),
                "resource": "",
            });
            request.insert("resource".to_string(), resource);
        }
    }
}

fn envelope_types(value: &Value) -> Result<TypeMeta, DecodeError> {
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();

    let group = api_version.split_once('/').map(|(group, _)| group);
    if group != Some(ADMISSION_GROUP) || kind != REVIEW_KIND {
        return Err(DecodeError::Envelope {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        });
    }

    Ok(TypeMeta {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn review(request: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": request,
        }))
        .unwrap()
    }

    fn pod_request(operation: &str) -> Value {
        json!({
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "name": "web",
            "namespace": "default",
            "operation": operation,
            "userInfo": {"username": "admin"},
            "dryRun": false,
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "web", "labels": {"nfs-home": "true"}},
                "spec": {"containers": [{"name": "app", "image": "nginx"}]}
            }
        })
    }

    #[test]
    fn decodes_a_create_request() {
        let request = decode(&review(pod_request("CREATE"))).unwrap();
        assert_eq!(request.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(request.kind.kind, "Pod");
        assert_eq!(operation_name(&request.operation), "CREATE");
        let object = request.object.expect("object");
        assert_eq!(object.metadata.name.as_deref(), Some("web"));
        assert_eq!(object.data["spec"]["containers"][0]["name"], "app");
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(decode(b"{not json"), Err(DecodeError::Json(_))));
        assert_eq!(observe_envelope(b"{not json"), ObservedEnvelope::default());
    }

    #[test]
    fn rejects_foreign_envelopes() {
        let body = serde_json::to_vec(&json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "request": pod_request("CREATE"),
        }))
        .unwrap();
        let err = decode(&body).unwrap_err();
        assert!(matches!(err, DecodeError::Envelope { ref kind, .. } if kind == "Pod"));

        let observed = observe_envelope(&body);
        assert_eq!(observed.uid.as_deref(), Some("705ab4f5-6393-11e8-b7cc-42010a800002"));
        assert!(observed.types.is_none());
    }

    #[test]
    fn rejects_review_without_request() {
        let body = serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
        }))
        .unwrap();
        assert!(matches!(decode(&body), Err(DecodeError::MissingRequest)));
    }

    #[test]
    fn rejects_malformed_request_fields() {
        let body = review(json!({"uid": "abc", "operation": "CREATE", "dryRun": false}));
        assert!(matches!(decode(&body), Err(DecodeError::Request(_))));
        assert_eq!(observe_envelope(&body).uid.as_deref(), Some("abc"));
    }

    #[test]
    fn unread_request_fields_may_be_omitted() {
        let mut request = pod_request("CREATE");
        let fields = request.as_object_mut().unwrap();
        fields.remove("userInfo");
        fields.remove("resource");
        fields.remove("dryRun");

        let request = decode(&review(request)).unwrap();
        assert_eq!(request.kind.kind, "Pod");
        assert!(!request.dry_run);
        assert!(request.object.is_some());
    }

    #[test]
    fn create_and_update_need_an_object() {
        for operation in ["CREATE", "UPDATE"] {
            let mut request = pod_request(operation);
            request.as_object_mut().unwrap().remove("object");
            let err = decode(&review(request)).unwrap_err();
            match err {
                DecodeError::MissingObject { operation, .. } => assert!(!operation.is_empty()),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn delete_may_omit_the_object() {
        let mut request = pod_request("DELETE");
        request.as_object_mut().unwrap().remove("object");
        let request = decode(&review(request)).unwrap();
        assert!(request.object.is_none());
    }

    #[test]
    fn failure_response_echoes_uid_and_envelope() {
        let mut request = pod_request("CREATE");
        request.as_object_mut().unwrap().remove("object");
        let body = serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1beta1",
            "kind": "AdmissionReview",
            "request": request,
        }))
        .unwrap();

        let err = decode(&body).unwrap_err();
        let response = failure_response(&observe_envelope(&body), &err);
        let json = serde_json::to_value(response.into_review()).unwrap();

        assert_eq!(json["apiVersion"], "admission.k8s.io/v1beta1");
        assert_eq!(json["kind"], "AdmissionReview");
        assert_eq!(json["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(json["response"]["allowed"], false);
        assert!(
            json["response"]["status"]["message"]
                .as_str()
                .unwrap()
                .contains("carries no object")
        );
        assert!(json["response"].get("patch").is_none());
    }
}
