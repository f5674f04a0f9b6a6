//! Conversation endpoints
//!
//! The caller is always the authenticated `User`; for individual
//! conversations the caller is the therapist side.

use crate::{
    error::AppError,
    middleware::guards::User,
    models::{ConversationKind, ConversationOptions, MetadataUpdate, Participant},
    services::NewConversationWithMessage,
    state::AppState,
};
use actix_web::{get, patch, post, put, web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================
// Request/Response DTOs
// ============================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub client_id: Uuid,
    #[serde(flatten)]
    pub options: ConversationOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub title: String,
    pub participant_ids: Vec<Uuid>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWithMessageRequest {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub participant_ids: Vec<Uuid>,
    pub initial_message: String,
    #[serde(flatten)]
    pub options: ConversationOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceParticipantsRequest {
    pub participant_ids: Vec<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsResponse {
    pub conversation_id: Uuid,
    pub participants: Vec<Participant>,
}

// ============================================
// Endpoints
// ============================================

#[get("/api/v1/conversations")]
pub async fn list_conversations(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let conversations = state.service.list_conversations(user.id).await?;
    Ok(HttpResponse::Ok().json(conversations))
}

#[get("/api/v1/conversations/{id}")]
pub async fn get_conversation(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let summary = state
        .service
        .get_conversation(path.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::Ok().json(summary))
}

/// POST /api/v1/conversations
/// Individual conversation between `clientId` and the caller
#[post("/api/v1/conversations")]
pub async fn create_conversation(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateConversationRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let conversation = state
        .service
        .create_individual_conversation(body.client_id, user.id, body.options)
        .await?;
    Ok(HttpResponse::Created().json(conversation))
}

/// POST /api/v1/conversations/quick
/// Reuse the caller's conversation with `clientId`, creating it if needed
#[post("/api/v1/conversations/quick")]
pub async fn find_or_create_conversation(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateConversationRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let conversation = state
        .service
        .find_or_create_individual_conversation(body.client_id, user.id, body.options)
        .await?;
    Ok(HttpResponse::Ok().json(conversation))
}

#[post("/api/v1/conversations/group")]
pub async fn create_group(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateGroupRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let options = ConversationOptions {
        title: None,
        category: body.category,
        priority: body.priority,
    };
    let conversation = state
        .service
        .create_group_conversation(&body.title, &body.participant_ids, user.id, options)
        .await?;
    Ok(HttpResponse::Created().json(conversation))
}

#[post("/api/v1/conversations/with-message")]
pub async fn create_with_message(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<CreateWithMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let (conversation, message) = state
        .service
        .create_conversation_with_initial_message(
            user.id,
            NewConversationWithMessage {
                kind: body.kind,
                participant_ids: body.participant_ids,
                initial_message: body.initial_message,
                options: body.options,
            },
        )
        .await?;
    Ok(HttpResponse::Created().json(serde_json::json!({
        "conversation": conversation,
        "message": message,
    })))
}

#[patch("/api/v1/conversations/{id}")]
pub async fn update_conversation(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<Uuid>,
    body: web::Json<MetadataUpdate>,
) -> Result<HttpResponse, AppError> {
    let conversation = state
        .service
        .update_conversation_metadata(path.into_inner(), user.id, body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(conversation))
}

/// PUT /api/v1/conversations/{id}/participants
/// Replace the active participant set
///
/// Authorization: Requires group admin
#[put("/api/v1/conversations/{id}/participants")]
pub async fn replace_participants(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<Uuid>,
    body: web::Json<ReplaceParticipantsRequest>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let participants = state
        .service
        .replace_group_participants(conversation_id, user.id, &body.participant_ids)
        .await?;
    Ok(HttpResponse::Ok().json(ParticipantsResponse {
        conversation_id,
        participants,
    }))
}
