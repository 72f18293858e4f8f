//! Cart and shipping-group API routes.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use composable_core::{CartId, CartItemId, ShippingGroupId};

use crate::commerce::{Cart, CartItem};
use crate::error::{ApiResponse, AppError};
use crate::session::SessionContext;
use crate::shipping::{CreateShippingGroup, DeliveryProgress, ShippingGroupView, ShippingGroupsOverview};
use crate::state::AppState;

use super::owned_cart;

/// Item reference change. `null` removes the item from its group.
#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    pub shipping_group_id: Option<ShippingGroupId>,
}

/// Acknowledgement of a deleted group.
#[derive(Debug, Serialize)]
pub struct Deleted {
    pub id: ShippingGroupId,
}

/// `GET /api/carts/{cart_id}`
#[instrument(skip(state, session))]
pub async fn show(
    State(state): State<AppState>,
    session: SessionContext,
    Path(cart_id): Path<CartId>,
) -> Result<ApiResponse<Cart>, AppError> {
    let cart_id = owned_cart(&session, &cart_id)?;
    let cart = state.carts().get_or_load(state.commerce(), &cart_id).await?;
    Ok(ApiResponse::ok(cart))
}

/// `GET /api/carts/{cart_id}/shipping-groups`
#[instrument(skip(state, session))]
pub async fn list_groups(
    State(state): State<AppState>,
    session: SessionContext,
    Path(cart_id): Path<CartId>,
) -> Result<ApiResponse<ShippingGroupsOverview>, AppError> {
    let cart_id = owned_cart(&session, &cart_id)?;
    let overview = state.shipping_groups().list(&cart_id).await?;
    Ok(ApiResponse::ok(overview))
}

/// `POST /api/carts/{cart_id}/shipping-groups`
#[instrument(skip(state, session, input))]
pub async fn create_group(
    State(state): State<AppState>,
    session: SessionContext,
    Path(cart_id): Path<CartId>,
    Json(input): Json<CreateShippingGroup>,
) -> Result<(StatusCode, ApiResponse<ShippingGroupView>), AppError> {
    let cart_id = owned_cart(&session, &cart_id)?;
    let view = state
        .shipping_groups()
        .create(&cart_id, input, session.credential())
        .await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(view)))
}

/// `DELETE /api/carts/{cart_id}/shipping-groups/{group_id}`
#[instrument(skip(state, session))]
pub async fn delete_group(
    State(state): State<AppState>,
    session: SessionContext,
    Path((cart_id, group_id)): Path<(CartId, ShippingGroupId)>,
) -> Result<ApiResponse<Deleted>, AppError> {
    let cart_id = owned_cart(&session, &cart_id)?;
    state.shipping_groups().delete(&cart_id, &group_id).await?;
    Ok(ApiResponse::ok(Deleted { id: group_id }))
}

/// `PUT /api/carts/{cart_id}/items/{item_id}`
#[instrument(skip(state, session, request))]
pub async fn update_item(
    State(state): State<AppState>,
    session: SessionContext,
    Path((cart_id, item_id)): Path<(CartId, CartItemId)>,
    Json(request): Json<UpdateItemRequest>,
) -> Result<ApiResponse<CartItem>, AppError> {
    let cart_id = owned_cart(&session, &cart_id)?;
    let groups = state.shipping_groups();
    let item = match request.shipping_group_id {
        Some(group_id) => groups.attach_item(&cart_id, &item_id, &group_id).await?,
        None => groups.remove_item(&cart_id, &item_id).await?,
    };
    Ok(ApiResponse::ok(item))
}

/// `GET /api/carts/{cart_id}/delivery-progress`
#[instrument(skip(state, session))]
pub async fn delivery_progress(
    State(state): State<AppState>,
    session: SessionContext,
    Path(cart_id): Path<CartId>,
) -> Result<ApiResponse<DeliveryProgress>, AppError> {
    let cart_id = owned_cart(&session, &cart_id)?;
    let progress = state.shipping_groups().delivery_progress(&cart_id).await?;
    Ok(ApiResponse::ok(progress))
}
