//! The uniform actions shared by every resource kind.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{error, warn};

use super::KindSpec;
use crate::cluster::{object_name, ClusterClient, ClusterError};
use crate::protocol::{decode_params, Code, Response};
use crate::registry::{actions, CommandRegistry};

/// Attempts made by an update before a conflict is reported.
pub const CONFLICT_ATTEMPTS: u32 = 5;
const CONFLICT_BACKOFF_BASE: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListParams {
    name: String,
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GetParams {
    name: String,
    namespace: String,
    output: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeleteTarget {
    name: String,
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeleteParams {
    resources: Vec<DeleteTarget>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateYamlParams {
    name: String,
    namespace: String,
    yaml: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateObjParams {
    name: String,
    namespace: String,
    replicas: i64,
}

/// Why an update under conflict retry gave up.
enum UpdateFailure {
    /// The latest version could not be fetched.
    Get(ClusterError),
    Update(ClusterError),
}

impl UpdateFailure {
    fn into_response(self) -> Response {
        match self {
            Self::Get(e) => Response::error(Code::GetError, e.to_string()),
            Self::Update(e) => Response::error(Code::UpdateError, e.to_string()),
        }
    }
}

/// Adapter for one resource kind over the cluster collaborator.
#[derive(Clone)]
pub struct KindResource {
    spec: &'static KindSpec,
    client: Arc<dyn ClusterClient>,
}

impl KindResource {
    pub fn new(spec: &'static KindSpec, client: Arc<dyn ClusterClient>) -> Self {
        Self { spec, client }
    }

    /// Install a handler for every action the kind supports.
    pub fn register(&self, registry: &mut CommandRegistry) {
        let resource = self.spec.resource;
        for &action in self.spec.actions {
            let this = self.clone();
            match action {
                actions::LIST => registry.register(resource, action, move |p| this.clone().list(p)),
                actions::GET => registry.register(resource, action, move |p| this.clone().get(p)),
                actions::DELETE => {
                    registry.register(resource, action, move |p| this.clone().delete(p));
                }
                actions::UPDATE_YAML => {
                    registry.register(resource, action, move |p| this.clone().update_yaml(p));
                }
                actions::UPDATE_OBJ => {
                    registry.register(resource, action, move |p| this.clone().update_obj(p));
                }
                other => warn!(resource, action = other, "No generic handler for action"),
            }
        }
    }

    async fn list(self, params: Value) -> Response {
        let params: ListParams = decode_params(&params);
        let namespace = Some(params.namespace.as_str()).filter(|ns| !ns.is_empty());
        match self.client.list(self.spec.api, namespace).await {
            Ok(objects) => {
                let items: Vec<Value> = objects
                    .into_iter()
                    .filter(|o| params.name.is_empty() || object_name(o).contains(&params.name))
                    .collect();
                Response::success(Value::Array(items))
            }
            Err(e) => {
                error!(resource = self.spec.resource, "List error: {e}");
                Response::error(Code::ListError, e.to_string())
            }
        }
    }

    async fn get(self, params: Value) -> Response {
        let params: GetParams = decode_params(&params);
        if let Some(invalid) = self.check_target(&params.name, &params.namespace) {
            return invalid;
        }
        let object = match self
            .client
            .get(self.spec.api, &params.namespace, &params.name)
            .await
        {
            Ok(object) => object,
            Err(e) => return Response::error(Code::GetError, e.to_string()),
        };
        if params.output == "yaml" {
            return match serde_yaml::to_string(&object) {
                Ok(yaml) => Response::success(Value::String(yaml)),
                Err(e) => Response::error(Code::MarshalError, e.to_string()),
            };
        }
        Response::success(object)
    }

    async fn delete(self, params: Value) -> Response {
        let params: DeleteParams = decode_params(&params);
        for target in &params.resources {
            if let Err(e) = self
                .client
                .delete(self.spec.api, &target.namespace, &target.name)
                .await
            {
                error!(
                    resource = self.spec.resource,
                    namespace = %target.namespace,
                    name = %target.name,
                    "Delete error: {e}"
                );
                return Response::error(
                    Code::DeleteError,
                    format!("Delete {} error: {e}", target.name),
                );
            }
        }
        Response::ok()
    }

    async fn update_yaml(self, params: Value) -> Response {
        let params: UpdateYamlParams = decode_params(&params);
        let mut object: Value = match serde_yaml::from_str(&params.yaml) {
            Ok(object @ Value::Object(_)) => object,
            Ok(_) => return Response::error(Code::ParamsError, "Parse yaml error: not a mapping"),
            Err(e) => return Response::error(Code::ParamsError, format!("Parse yaml error: {e}")),
        };
        let Some(metadata) = metadata_mut(&mut object) else {
            return Response::error(Code::ParamsError, "Parse yaml error: metadata is not a mapping");
        };
        let unnamed = metadata
            .get("name")
            .and_then(Value::as_str)
            .is_none_or(str::is_empty);
        if unnamed && !params.name.is_empty() {
            metadata.insert("name".to_string(), json!(params.name));
        }
        if self.spec.api.namespaced
            && !metadata.contains_key("namespace")
            && !params.namespace.is_empty()
        {
            metadata.insert("namespace".to_string(), json!(params.namespace));
        }
        let namespace = params.namespace;

        match self
            .retry_on_conflict(&namespace, |latest| {
                let mut next = object.clone();
                if let (Some(latest), Some(metadata)) = (latest, metadata_mut(&mut next)) {
                    let version = latest.pointer("/metadata/resourceVersion").cloned();
                    metadata.insert("resourceVersion".to_string(), version.unwrap_or(Value::Null));
                }
                next
            })
            .await
        {
            Ok(_) => Response::ok(),
            Err(failure) => failure.into_response(),
        }
    }

    /// Scale to `replicas`. Kinds without a replica count still validate the
    /// params and write the latest object back unchanged.
    async fn update_obj(self, params: Value) -> Response {
        let params: UpdateObjParams = decode_params(&params);
        if let Some(invalid) = self.check_target(&params.name, &params.namespace) {
            return invalid;
        }
        if params.replicas < 1 {
            return Response::error(Code::ParamsError, "Replicas is less than 1");
        }
        let replicas = params.replicas;
        let scales = self.spec.scales();
        let name = params.name;

        let result = async {
            let latest = self
                .client
                .get(self.spec.api, &params.namespace, &name)
                .await
                .map_err(UpdateFailure::Get)?;
            self.retry_on_conflict(&params.namespace, |fresh| {
                let mut next = fresh.cloned().unwrap_or_else(|| latest.clone());
                if scales {
                    if let Some(Value::Object(spec)) = next
                        .as_object_mut()
                        .map(|o| o.entry("spec").or_insert_with(|| json!({})))
                    {
                        spec.insert("replicas".to_string(), json!(replicas));
                    }
                }
                next
            })
            .await
        }
        .await;

        match result {
            Ok(_) => Response::ok(),
            Err(failure) => failure.into_response(),
        }
    }

    /// Replace `build(None)`; on conflict refetch the latest version and
    /// replace `build(Some(latest))`, up to [`CONFLICT_ATTEMPTS`] in total.
    async fn retry_on_conflict<F>(&self, namespace: &str, build: F) -> Result<Value, UpdateFailure>
    where
        F: Fn(Option<&Value>) -> Value,
    {
        let mut candidate = build(None);
        let mut attempt = 0;
        loop {
            match self.client.replace(self.spec.api, &candidate).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() && attempt + 1 < CONFLICT_ATTEMPTS => {
                    warn!(
                        resource = self.spec.resource,
                        attempt = attempt + 1,
                        "Update conflict, retrying: {e}"
                    );
                    tokio::time::sleep(CONFLICT_BACKOFF_BASE * 2_u32.pow(attempt)).await;
                    attempt += 1;
                    let latest = self
                        .client
                        .get(self.spec.api, namespace, object_name(&candidate))
                        .await
                        .map_err(UpdateFailure::Get)?;
                    candidate = build(Some(&latest));
                }
                Err(e) => {
                    error!(resource = self.spec.resource, "Update error: {e}");
                    return Err(UpdateFailure::Update(e));
                }
            }
        }
    }

    fn check_target(&self, name: &str, namespace: &str) -> Option<Response> {
        if name.is_empty() {
            return Some(Response::error(
                Code::ParamsError,
                format!("{} name is blank", self.spec.display),
            ));
        }
        if self.spec.api.namespaced && namespace.is_empty() {
            return Some(Response::error(Code::ParamsError, "Namespace is blank"));
        }
        None
    }
}

/// `metadata` of a raw object as a map, created empty when absent. `None`
/// when the object or its `metadata` is not a mapping.
fn metadata_mut(object: &mut Value) -> Option<&mut Map<String, Value>> {
    object
        .as_object_mut()?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}
