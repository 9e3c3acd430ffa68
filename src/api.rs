use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::classify::ActionKind;
use crate::engine;
use crate::settings::{Settings, ShowRule};
use crate::state::{AppState, EnginePhase, OverlayPosition};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(start_automation))
        .route("/stop", post(stop_automation))
        .route("/pause", post(pause_automation))
        .route("/prepare", post(prepare_session))
        .route("/logout", post(logout_session))
        .route("/status", get(get_status))
        .route("/actions", get(get_actions))
        .route("/action/{kind}", post(trigger_action))
        .route("/automation", post(set_automation_enabled))
        .route("/timer/add", post(timer_add))
        .route("/timer/set", post(timer_set))
        .route("/timer/cancel", post(timer_cancel))
        .route("/timer/pause", post(timer_pause))
        .route("/timer/to-end", post(timer_to_end))
        .route("/timer/restore-volume", post(timer_restore_volume))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/rules/{key}", put(put_rule))
        .route("/rules/{key}/disabled", post(set_series_disabled))
        .route("/overlay", get(get_overlay).put(put_overlay))
        .route("/overlay/visible", post(set_overlay_visible))
        .route("/screenshot", get(get_screenshot))
        .with_state(state)
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> Result<(), StatusCode> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if let Some(token) = auth.strip_prefix("Bearer ")
        && token == expected_token
    {
        return Ok(());
    }

    Err(StatusCode::UNAUTHORIZED)
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let token = {
        let s = state.lock().await;
        s.config.auth_token.clone()
    };
    check_auth(headers, &token)
}

/// Replace the settings snapshot wholesale after an edit, persisting it to
/// the settings file first.
async fn mutate_settings(
    state: &AppState,
    edit: impl FnOnce(&mut Settings),
) -> Result<Arc<Settings>, StatusCode> {
    let mut s = state.lock().await;
    let mut fresh = (*s.settings).clone();
    edit(&mut fresh);

    if let Err(e) = fresh.save(&s.config.settings_file) {
        tracing::error!("failed to persist settings: {e:#}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let snapshot = Arc::new(fresh);
    s.settings = snapshot.clone();
    s.gate.reconfigure(&snapshot);
    Ok(snapshot)
}

async fn start_automation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let mut s = state.lock().await;

    match s.phase {
        EnginePhase::Paused => {
            s.phase = EnginePhase::Running;
            s.pause_notify.notify_one();
            Ok(Json(json!({"status": "resumed"})))
        }
        EnginePhase::Idle | EnginePhase::Ready => {
            if let Some(handle) = s.engine_handle.take() {
                handle.abort();
            }

            let app_state = state.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = engine::run_engine(app_state.clone()).await {
                    tracing::error!("automation error: {e:#}");
                    let mut s = app_state.lock().await;
                    s.phase = EnginePhase::Idle;
                }
            });

            s.engine_handle = Some(handle);
            Ok(Json(json!({"status": "started"})))
        }
        EnginePhase::Running | EnginePhase::Preparing => Err(StatusCode::CONFLICT),
    }
}

async fn stop_automation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let mut s = state.lock().await;

    if let Some(handle) = s.engine_handle.take() {
        handle.abort();
    }

    // Wake any paused waiter so it can exit
    s.pause_notify.notify_one();

    s.phase = if s.browser.is_some() {
        EnginePhase::Ready
    } else {
        EnginePhase::Idle
    };

    Ok(Json(json!({"status": "stopped"})))
}

async fn pause_automation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let mut s = state.lock().await;

    match s.phase {
        EnginePhase::Running => {
            s.phase = EnginePhase::Paused;
            Ok(Json(json!({"status": "paused"})))
        }
        // Idempotent
        EnginePhase::Paused => Ok(Json(json!({"status": "paused"}))),
        _ => Err(StatusCode::CONFLICT),
    }
}

async fn prepare_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let s = state.lock().await;

    match s.phase {
        EnginePhase::Idle => {
            drop(s);

            let app_state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = engine::prepare_browser(&app_state).await {
                    tracing::error!("prepare failed: {e:#}");
                    let mut s = app_state.lock().await;
                    s.phase = EnginePhase::Idle;
                }
            });

            Ok(Json(json!({"status": "preparing"})))
        }
        EnginePhase::Ready | EnginePhase::Paused => Ok(Json(json!({"status": "ready"}))),
        EnginePhase::Preparing | EnginePhase::Running => Err(StatusCode::CONFLICT),
    }
}

async fn logout_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let mut s = state.lock().await;

    if let Some(handle) = s.engine_handle.take() {
        handle.abort();
    }
    s.pause_notify.notify_one();

    // Drop browser (kills Chromium)
    s.browser = None;
    s.phase = EnginePhase::Idle;

    Ok(Json(json!({"status": "logged_out"})))
}

#[derive(Serialize)]
struct TimerStatus {
    running: bool,
    user_paused: bool,
    suspended: bool,
    remaining_secs: f64,
    total_secs: f64,
}

#[derive(Serialize)]
struct StatusResponse {
    phase: EnginePhase,
    running: bool,
    paused: bool,
    automation_enabled: bool,
    has_video: bool,
    playing: bool,
    series_title: String,
    series_key: String,
    video_remaining_secs: f64,
    timer: TimerStatus,
}

async fn get_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let (browser, phase, enabled, series, timer) = {
        let s = state.lock().await;
        (
            s.browser.clone(),
            s.phase,
            s.settings.global_enabled,
            s.series.clone(),
            s.timer.clone(),
        )
    };

    let video = match browser {
        Some(b) => b.video_state().await.unwrap_or_default(),
        None => Default::default(),
    };

    Ok(Json(StatusResponse {
        phase,
        running: phase == EnginePhase::Running,
        paused: phase == EnginePhase::Paused,
        automation_enabled: enabled,
        has_video: video.present,
        playing: video.is_playing(),
        series_title: series.display_title,
        series_key: series.canonical_key,
        video_remaining_secs: video.remaining_secs(),
        timer: TimerStatus {
            running: timer.running,
            user_paused: timer.user_paused,
            suspended: timer.suspended,
            remaining_secs: timer.remaining_secs,
            total_secs: timer.total_secs,
        },
    }))
}

async fn get_actions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let s = state.lock().await;
    Ok(Json(s.actions.clone()))
}

async fn trigger_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let kind: ActionKind = kind.parse().map_err(|_| StatusCode::BAD_REQUEST)?;

    let clicked = engine::trigger_action(&state, kind).await.map_err(|e| {
        tracing::error!("manual {} failed: {e:#}", kind.as_str());
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({"clicked": clicked})))
}

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_automation_enabled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EnabledBody>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    mutate_settings(&state, |s| s.global_enabled = body.enabled).await?;
    Ok(Json(json!({"enabled": body.enabled})))
}

#[derive(Deserialize)]
struct SecondsBody {
    seconds: f64,
}

async fn timer_add(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SecondsBody>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let mut s = state.lock().await;
    s.timer.add_seconds(body.seconds);
    Ok(Json(json!({"remaining_secs": s.timer.remaining_secs})))
}

async fn timer_set(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SecondsBody>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let mut s = state.lock().await;
    s.timer.set_absolute(body.seconds);
    Ok(Json(json!({"remaining_secs": s.timer.remaining_secs})))
}

async fn timer_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let mut s = state.lock().await;
    s.timer.cancel();
    Ok(Json(json!({"status": "cancelled"})))
}

async fn timer_pause(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let mut s = state.lock().await;
    s.timer.toggle_user_pause();
    Ok(Json(json!({"user_paused": s.timer.user_paused})))
}

/// Arm the timer for exactly the rest of the episode.
async fn timer_to_end(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let browser = {
        let s = state.lock().await;
        s.browser.clone()
    }
    .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;

    let video = browser.video_state().await.map_err(|e| {
        tracing::error!("video probe failed: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let remaining = video.remaining_secs();
    if remaining <= 0.0 {
        return Err(StatusCode::CONFLICT);
    }

    let mut s = state.lock().await;
    s.timer.set_absolute(remaining);
    Ok(Json(json!({"remaining_secs": s.timer.remaining_secs})))
}

async fn timer_restore_volume(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let restored = engine::restore_volume(&state).await.map_err(|e| {
        tracing::error!("restore volume failed: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({"restored": restored})))
}

async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let s = state.lock().await;
    Ok(Json((*s.settings).clone()))
}

async fn put_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(fresh): Json<Settings>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let snapshot = mutate_settings(&state, |s| *s = fresh).await?;
    Ok(Json((*snapshot).clone()))
}

async fn put_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(rule): Json<ShowRule>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let snapshot = mutate_settings(&state, |s| {
        s.per_show_rules_by_key.insert(key.clone(), rule);
    })
    .await?;
    Ok(Json(json!({"rules": snapshot.per_show_rules_by_key})))
}

#[derive(Deserialize)]
struct DisabledBody {
    disabled: bool,
}

async fn set_series_disabled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<DisabledBody>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    mutate_settings(&state, |s| {
        if body.disabled {
            s.disabled_series_keys.insert(key.clone());
        } else {
            s.disabled_series_keys.remove(&key);
        }
    })
    .await?;
    Ok(Json(json!({"key": key, "disabled": body.disabled})))
}

async fn get_overlay(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let s = state.lock().await;
    Ok(Json(json!({
        "position": s.local.overlay,
        "visible": s.settings.countdown_visible,
        "cosmetics": s.settings.overlay,
    })))
}

async fn put_overlay(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(position): Json<OverlayPosition>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let mut s = state.lock().await;
    s.local.overlay = position;
    s.persist_local();
    Ok(Json(json!({"position": s.local.overlay})))
}

#[derive(Deserialize)]
struct VisibleBody {
    visible: bool,
}

async fn set_overlay_visible(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<VisibleBody>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    mutate_settings(&state, |s| s.countdown_visible = body.visible).await?;
    Ok(Json(json!({"visible": body.visible})))
}

async fn get_screenshot(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, &headers).await?;

    let browser = {
        let s = state.lock().await;
        s.browser.clone()
    }
    .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;

    let png_bytes = browser.take_screenshot().await.map_err(|e| {
        tracing::error!("screenshot failed: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                "inline; filename=\"screenshot.png\"".to_owned(),
            ),
        ],
        png_bytes,
    ))
}
