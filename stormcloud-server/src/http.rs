//! Administrative JSON API
//!
//! Vendors, rules, response variants and substitutions are edited here. The
//! routes are nested under `/admin` by the stub server, which keeps them out
//! of interception. Nothing is cached, so an edit applies to the very next
//! intercepted request.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use stormcloud_common::{
    ResponseVariant, Rule, RuleDraft, Substitution, SubstitutionDraft, VariantDraft, Vendor,
    VendorDraft,
};
use stormcloud_core::StoreError;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::database::{Database, RuleFilter};

/// Errors returned by admin handlers
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid payload: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<StoreError> for AdminError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => AdminError::NotFound(e.to_string()),
            StoreError::Conflict { .. } => AdminError::Conflict(e.to_string()),
            StoreError::Backend(msg) => AdminError::Database(msg),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Conflict(_) => StatusCode::CONFLICT,
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::Database(_) => {
                error!("Admin request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// A rule with everything that shapes its response
#[derive(Debug, Serialize)]
pub struct RuleDetail {
    #[serde(flatten)]
    pub rule: Rule,
    pub variants: Vec<ResponseVariant>,
    pub substitutions: Vec<Substitution>,
}

type AdminResult<T> = Result<T, AdminError>;

/// Admin routes, relative to the `/admin` prefix
pub fn admin_routes(db: Arc<Database>) -> Router {
    Router::new()
        .route("/vendors", get(list_vendors).post(create_vendor))
        .route(
            "/vendors/:id",
            get(get_vendor).put(update_vendor).delete(delete_vendor),
        )
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/:id", get(get_rule).put(update_rule).delete(delete_rule))
        .route("/rules/:id/variants", get(list_variants).post(create_variant))
        .route("/variants/:id", put(update_variant).delete(delete_variant))
        .route(
            "/rules/:id/substitutions",
            get(list_substitutions).post(create_substitution),
        )
        .route(
            "/substitutions/:id",
            put(update_substitution).delete(delete_substitution),
        )
        .layer(CorsLayer::permissive())
        .with_state(db)
}

fn validate_vendor(draft: &VendorDraft) -> AdminResult<()> {
    if draft.name.trim().is_empty() {
        return Err(AdminError::BadRequest("vendor name is required".to_string()));
    }
    if draft.base_url.trim().is_empty() {
        return Err(AdminError::BadRequest("vendor base_url is required".to_string()));
    }
    Ok(())
}

/// Checks a rule payload and normalizes its verb to upper case
fn validate_rule(mut draft: RuleDraft) -> AdminResult<RuleDraft> {
    if draft.path.is_empty() {
        return Err(AdminError::BadRequest("rule path is required".to_string()));
    }
    draft.verb = draft.verb.trim().to_uppercase();
    if draft.verb.is_empty() {
        return Err(AdminError::BadRequest("rule verb is required".to_string()));
    }
    if draft.action.trim() == "live"
        && draft.live_url.as_deref().map_or(true, |url| url.trim().is_empty())
    {
        return Err(AdminError::BadRequest(
            "a live rule needs a live_url".to_string(),
        ));
    }
    Ok(draft)
}

fn validate_substitution(draft: &SubstitutionDraft) -> AdminResult<()> {
    if draft.position < 0 {
        return Err(AdminError::BadRequest(format!(
            "position must not be negative (got {})",
            draft.position
        )));
    }
    if draft.find.is_empty() {
        return Err(AdminError::BadRequest("substitution find text is required".to_string()));
    }
    Ok(())
}

async fn list_vendors(State(db): State<Arc<Database>>) -> AdminResult<Json<Vec<Vendor>>> {
    Ok(Json(db.list_vendors().await?))
}

async fn get_vendor(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
) -> AdminResult<Json<Vendor>> {
    Ok(Json(db.get_vendor(id).await?))
}

async fn create_vendor(
    State(db): State<Arc<Database>>,
    Json(draft): Json<VendorDraft>,
) -> AdminResult<(StatusCode, Json<Vendor>)> {
    validate_vendor(&draft)?;
    let vendor = db.create_vendor(draft).await?;
    info!("Vendor {} registered for hostname {}", vendor, vendor.base_url);
    Ok((StatusCode::CREATED, Json(vendor)))
}

async fn update_vendor(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
    Json(draft): Json<VendorDraft>,
) -> AdminResult<Json<Vendor>> {
    validate_vendor(&draft)?;
    Ok(Json(db.update_vendor(id, draft).await?))
}

async fn delete_vendor(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
) -> AdminResult<StatusCode> {
    db.delete_vendor(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_rules(
    State(db): State<Arc<Database>>,
    Query(filter): Query<RuleFilter>,
) -> AdminResult<Json<Vec<Rule>>> {
    Ok(Json(db.list_rules(&filter).await?))
}

async fn get_rule(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
) -> AdminResult<Json<RuleDetail>> {
    let rule = db.get_rule(id).await?;
    let variants = db.list_variants(id).await?;
    let substitutions = db.list_substitutions(id).await?;
    Ok(Json(RuleDetail {
        rule,
        variants,
        substitutions,
    }))
}

async fn create_rule(
    State(db): State<Arc<Database>>,
    Json(draft): Json<RuleDraft>,
) -> AdminResult<(StatusCode, Json<Rule>)> {
    let rule = db.insert_rule(validate_rule(draft)?).await?;
    info!("Rule {} created with action {:?}", rule, rule.action);
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
    Json(draft): Json<RuleDraft>,
) -> AdminResult<Json<Rule>> {
    let rule = db.update_rule(id, validate_rule(draft)?).await?;
    info!("Rule {} now has action {:?}", rule, rule.action);
    Ok(Json(rule))
}

async fn delete_rule(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
) -> AdminResult<StatusCode> {
    db.delete_rule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_variants(
    State(db): State<Arc<Database>>,
    Path(rule_id): Path<i64>,
) -> AdminResult<Json<Vec<ResponseVariant>>> {
    db.get_rule(rule_id).await?;
    Ok(Json(db.list_variants(rule_id).await?))
}

async fn create_variant(
    State(db): State<Arc<Database>>,
    Path(rule_id): Path<i64>,
    Json(draft): Json<VariantDraft>,
) -> AdminResult<(StatusCode, Json<ResponseVariant>)> {
    let variant = db.create_variant(rule_id, draft).await?;
    Ok((StatusCode::CREATED, Json(variant)))
}

async fn update_variant(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
    Json(draft): Json<VariantDraft>,
) -> AdminResult<Json<ResponseVariant>> {
    Ok(Json(db.update_variant(id, draft).await?))
}

async fn delete_variant(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
) -> AdminResult<StatusCode> {
    db.delete_variant(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_substitutions(
    State(db): State<Arc<Database>>,
    Path(rule_id): Path<i64>,
) -> AdminResult<Json<Vec<Substitution>>> {
    db.get_rule(rule_id).await?;
    Ok(Json(db.list_substitutions(rule_id).await?))
}

async fn create_substitution(
    State(db): State<Arc<Database>>,
    Path(rule_id): Path<i64>,
    Json(draft): Json<SubstitutionDraft>,
) -> AdminResult<(StatusCode, Json<Substitution>)> {
    validate_substitution(&draft)?;
    let substitution = db.create_substitution(rule_id, draft).await?;
    Ok((StatusCode::CREATED, Json(substitution)))
}

async fn update_substitution(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
    Json(draft): Json<SubstitutionDraft>,
) -> AdminResult<Json<Substitution>> {
    validate_substitution(&draft)?;
    Ok(Json(db.update_substitution(id, draft).await?))
}

async fn delete_substitution(
    State(db): State<Arc<Database>>,
    Path(id): Path<i64>,
) -> AdminResult<StatusCode> {
    db.delete_substitution(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
