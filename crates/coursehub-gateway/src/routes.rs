//! API route handlers for the gateway.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, FromRequest, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use coursehub_core::{CallerIdentity, Clock, CourseHubError};
use coursehub_tracker::{BulkCreateRequest, LogFilter, LogPatch, NewActivityLog, Page};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use super::server::AppState;

/// Core error rendered as `{"ok": false, "error": ...}`.
#[derive(Debug)]
pub struct ApiError(pub CourseHubError);

impl From<CourseHubError> for ApiError {
    fn from(e: CourseHubError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(json!({"ok": false, "error": self.0.to_string()}))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// JSON body whose rejections render as a 400 validation error.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(CourseHubError::Validation(rejection.body_text()))),
        }
    }
}

/// Serialize `value` and mark it `ok`. Objects are merged, anything else goes
/// under `key`.
fn ok_body<T: Serialize>(key: &str, value: &T) -> Result<Value, ApiError> {
    let value = serde_json::to_value(value).map_err(CourseHubError::from)?;
    Ok(match value {
        Value::Object(mut map) => {
            map.insert("ok".into(), Value::Bool(true));
            Value::Object(map)
        }
        other => {
            let mut map = serde_json::Map::new();
            map.insert("ok".into(), Value::Bool(true));
            map.insert(key.into(), other);
            Value::Object(map)
        }
    })
}

/// Query string for the listing and reporting endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub course_offering_id: Option<String>,
    pub facilitator_id: Option<String>,
    pub week_number: Option<u32>,
    pub academic_year: Option<i32>,
    pub trimester: Option<u8>,
    pub is_submitted: Option<bool>,
    pub is_overdue: Option<bool>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl ListQuery {
    fn filter(&self) -> LogFilter {
        LogFilter {
            course_offering_id: self.course_offering_id.clone(),
            facilitator_id: self.facilitator_id.clone(),
            week_number: self.week_number,
            academic_year: self.academic_year,
            trimester: self.trimester,
            is_submitted: self.is_submitted,
            is_overdue: self.is_overdue,
            facilitator_scope: None,
        }
    }

    fn page(&self) -> Page {
        Page::new(self.page, self.limit)
    }
}

// ─── Health ──────────────────────────────────────────────

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let queue_ok = state.queue.stats().is_ok();
    Json(json!({
        "status": if queue_ok { "ok" } else { "degraded" },
        "service": "coursehub-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": queue_ok,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ─── Activity logs ───────────────────────────────────────

pub async fn create_log(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    ApiJson(body): ApiJson<NewActivityLog>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let log = state.service.create_log(&caller, body)?;
    let view = log.view(state.service.clock().now());
    Ok((
        StatusCode::CREATED,
        Json(json!({"ok": true, "activityLog": view})),
    ))
}

pub async fn bulk_create(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    ApiJson(body): ApiJson<BulkCreateRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let report = state.service.bulk_create(&caller, body)?;
    Ok((StatusCode::CREATED, Json(ok_body("report", &report)?)))
}

pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Query(q): Query<ListQuery>,
) -> ApiResult {
    let page = state.service.list_logs(&caller, q.filter(), q.page())?;
    Ok(Json(ok_body("activityLogs", &page)?))
}

pub async fn my_logs(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Query(q): Query<ListQuery>,
) -> ApiResult {
    let summary = state.service.my_logs(&caller, q.filter(), q.page())?;
    Ok(Json(ok_body("activityLogs", &summary)?))
}

pub async fn activity_stats(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Query(q): Query<ListQuery>,
) -> ApiResult {
    let stats = state.service.activity_stats(&caller, q.filter())?;
    Ok(Json(json!({"ok": true, "statistics": stats})))
}

pub async fn overdue_logs(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
) -> ApiResult {
    caller.require_manager()?;
    let logs = state.service.overdue_for(&caller)?;
    Ok(Json(json!({"ok": true, "count": logs.len(), "activityLogs": logs})))
}

pub async fn compliance_report(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Query(q): Query<ListQuery>,
) -> ApiResult {
    let report = state.service.compliance_report(&caller, q.filter())?;
    Ok(Json(ok_body("report", &report)?))
}

pub async fn get_log(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> ApiResult {
    let view = state.service.get_log(&caller, &id)?;
    Ok(Json(json!({"ok": true, "activityLog": view})))
}

pub async fn update_log(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<LogPatch>,
) -> ApiResult {
    let log = state.service.update_log(&caller, &id, patch)?;
    let view = log.view(state.service.clock().now());
    Ok(Json(json!({"ok": true, "activityLog": view})))
}

pub async fn delete_log(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> ApiResult {
    state.service.delete_log(&caller, &id)?;
    Ok(Json(json!({"ok": true, "deleted": id})))
}

// ─── Notifications ───────────────────────────────────────

pub async fn notification_status(State(state): State<Arc<AppState>>) -> ApiResult {
    let status = state.worker.status().await?;
    Ok(Json(ok_body("status", &status)?))
}

pub async fn trigger_sweep(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
) -> ApiResult {
    caller.require_manager()?;
    let report = state.worker.trigger_sweep()?;
    Ok(Json(ok_body("sweep", &report)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use coursehub_channels::DryRunEmailSender;
    use coursehub_core::config::{QueueConfig, SchedulerConfig};
    use coursehub_core::directory::Assignment;
    use coursehub_core::{ManualClock, StaticDirectory};
    use coursehub_queue::{JobQueue, RetryPolicy};
    use coursehub_scheduler::{Dispatcher, NotificationWorker, Scheduler};
    use coursehub_tracker::{ActivityLogService, TrackerDb};
    use tower::ServiceExt;

    struct Fixture {
        app: axum::Router,
        queue: Arc<JobQueue>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2025, 3, 5, 10, 0, 0).unwrap(),
        ));
        let directory = Arc::new(StaticDirectory::new());
        directory.add_manager("MGR-1", "Grace Hopper", "grace@uni.test");
        directory.add_manager("MGR-2", "Katherine Johnson", "kj@uni.test");
        directory.add_facilitator("FAC-1", "Alan Turing", "alan@uni.test", Some("MGR-1"));
        directory.add_facilitator("FAC-2", "Ada Lovelace", "ada@uni.test", Some("MGR-2"));
        for (co, fac, mgr, code) in [("CO-1", "FAC-1", "MGR-1", "CS201"), ("CO-2", "FAC-2", "MGR-2", "CS301")] {
            directory.add_assignment(Assignment {
                course_offering_id: co.into(),
                facilitator_id: fac.into(),
                manager_id: mgr.into(),
                module_name: "Data Structures".into(),
                module_code: code.into(),
            });
        }

        let tracker = Arc::new(TrackerDb::in_memory().unwrap());
        let queue = Arc::new(JobQueue::in_memory(clock.clone(), RetryPolicy::default()).unwrap());
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            tracker.clone(),
            clock.clone(),
            chrono::Duration::hours(24),
        ));
        let service = Arc::new(
            ActivityLogService::new(tracker.clone(), directory.clone(), clock.clone())
                .with_observer(scheduler.clone()),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            tracker,
            directory,
            Arc::new(DryRunEmailSender),
            clock.clone(),
            "https://lms.test",
        ));
        let worker = Arc::new(NotificationWorker::new(
            scheduler,
            dispatcher,
            clock,
            SchedulerConfig::default(),
            QueueConfig::default(),
        ));
        Fixture {
            app: build_router(AppState::new(service, worker, queue.clone())),
            queue,
        }
    }

    async fn call(
        app: &axum::Router,
        method: &str,
        uri: &str,
        caller: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some((role, id)) = caller {
            req = req.header("X-Caller-Role", role).header("X-Caller-Id", id);
        }
        let req = match body {
            Some(b) => req
                .header("Content-Type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    const FAC: Option<(&str, &str)> = Some(("facilitator", "FAC-1"));
    const MGR: Option<(&str, &str)> = Some(("manager", "MGR-1"));
    const OTHER_MGR: Option<(&str, &str)> = Some(("manager", "MGR-2"));

    fn new_log(week: u32) -> Value {
        json!({"courseOfferingId": "CO-1", "weekNumber": week, "academicYear": 2025, "trimester": 1})
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let f = fixture();
        let (status, body) = call(&f.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue"], true);
    }

    #[tokio::test]
    async fn test_missing_caller_is_unauthorized() {
        let f = fixture();
        let (status, body) = call(&f.app, "GET", "/api/v1/activity-logs", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);
        let (status, _) = call(
            &f.app,
            "GET",
            "/api/v1/activity-logs",
            Some(("admin", "X-1")),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_get_and_duplicate() {
        let f = fixture();
        let (status, body) = call(&f.app, "POST", "/api/v1/activity-logs", FAC, Some(new_log(3))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["activityLog"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["activityLog"]["isSubmitted"], false);
        assert_eq!(body["activityLog"]["completionPercentage"], 0);

        let (status, body) = call(&f.app, "POST", "/api/v1/activity-logs", FAC, Some(new_log(3))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);

        let uri = format!("/api/v1/activity-logs/{id}");
        let (status, _) = call(&f.app, "GET", &uri, MGR, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&f.app, "GET", &uri, OTHER_MGR, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&f.app, "GET", "/api/v1/activity-logs/AT-missing", FAC, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_validation_and_role_errors() {
        let f = fixture();
        let (status, _) = call(&f.app, "POST", "/api/v1/activity-logs", FAC, Some(new_log(60))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&f.app, "POST", "/api/v1/activity-logs", MGR, Some(new_log(3))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(
            &f.app,
            "GET",
            "/api/v1/activity-logs",
            Some(("student", "STU-1")),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&f.app, "GET", "/api/v1/activity-logs/compliance", FAC, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&f.app, "POST", "/api/v1/notifications/sweep", FAC, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_validation_error() {
        let f = fixture();
        let (_, body) = call(&f.app, "POST", "/api/v1/activity-logs", FAC, Some(new_log(3))).await;
        let uri = format!("/api/v1/activity-logs/{}", body["activityLog"]["id"].as_str().unwrap());

        let (status, body) = call(&f.app, "PUT", &uri, FAC, Some(json!({"intranetSync": "Finished"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().starts_with("Validation error"));

        let (status, body) = call(
            &f.app,
            "POST",
            "/api/v1/activity-logs",
            FAC,
            Some(json!({"courseOfferingId": "CO-1", "weekNumber": "three"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_completing_log_submits_and_queues_notice() {
        let f = fixture();
        let (_, body) = call(&f.app, "POST", "/api/v1/activity-logs", FAC, Some(new_log(3))).await;
        let id = body["activityLog"]["id"].as_str().unwrap().to_string();
        let patch = json!({
            "attendance": [true, true, true, true, true],
            "formativeOneGrading": "Done",
            "formativeTwoGrading": "Done",
            "summativeGrading": "Done",
            "courseModeration": "Done",
            "intranetSync": "Done",
            "gradeBookStatus": "Done"
        });
        let uri = format!("/api/v1/activity-logs/{id}");
        let (status, body) = call(&f.app, "PUT", &uri, FAC, Some(patch)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activityLog"]["isSubmitted"], true);
        assert_eq!(body["activityLog"]["completionPercentage"], 100);
        // The submission notice is due now; the creation-time reminder waits.
        let stats = f.queue.stats().unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.delayed, 1);

        let (status, _) = call(&f.app, "DELETE", &uri, FAC, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_list_pagination_and_scoping() {
        let f = fixture();
        let (status, body) = call(
            &f.app,
            "POST",
            "/api/v1/activity-logs/bulk",
            FAC,
            Some(json!({
                "courseOfferingId": "CO-1",
                "startWeek": 1,
                "endWeek": 5,
                "academicYear": 2025,
                "trimester": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["created"].as_array().unwrap().len(), 5);

        let (status, body) = call(&f.app, "GET", "/api/v1/activity-logs?page=2&limit=2", MGR, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["totalItems"], 5);
        assert_eq!(body["pagination"]["totalPages"], 3);
        assert_eq!(body["pagination"]["currentPage"], 2);
        let weeks: Vec<u64> = body["activityLogs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["weekNumber"].as_u64().unwrap())
            .collect();
        assert_eq!(weeks, vec![3, 2]);

        let (_, body) = call(&f.app, "GET", "/api/v1/activity-logs?weekNumber=4", FAC, None).await;
        assert_eq!(body["pagination"]["totalItems"], 1);

        let (_, body) = call(&f.app, "GET", "/api/v1/activity-logs", OTHER_MGR, None).await;
        assert_eq!(body["pagination"]["totalItems"], 0);

        let (status, body) = call(&f.app, "GET", "/api/v1/activity-logs/mine", FAC, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["statistics"]["totalLogs"], 5);

        let (status, body) = call(&f.app, "GET", "/api/v1/activity-logs/compliance", MGR, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["statistics"]["complianceRate"], 0.0);
        assert_eq!(body["activityLogs"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_notification_endpoints() {
        let f = fixture();
        let (status, body) = call(&f.app, "GET", "/api/v1/notifications/status", FAC, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert_eq!(body["activeJobCount"], 0);
        assert_eq!(body["mailer"], "dry-run");

        let (status, body) = call(&f.app, "POST", "/api/v1/notifications/sweep", MGR, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["overdueAlertsQueued"], 0);

        let (status, body) = call(&f.app, "GET", "/api/v1/activity-logs/overdue", MGR, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
    }
}
