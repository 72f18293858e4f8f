//! Shipping-group management.
//!
//! A shipping group is a destination (address plus shipping type) for a subset of
//! cart items. Membership lives on the items: an item belongs to the group its
//! `shipping_group_id` names, so every item is in at most one group by
//! construction. This module keeps the references consistent with the group
//! records when groups are created, deleted, or emptied.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use composable_core::{Address, AddressError, AddressId, CartId, CartItemId, ShippingGroupId};

use crate::commerce::{
    AccountCredential, Cart, CartCache, CartItem, CartItemUpdate, CommerceApi, CommerceError,
    DeliveryEstimate, NewShippingGroup, ShippingGroup, ShippingPrice,
};

/// Errors raised by shipping-group operations. All are shown to the shopper.
#[derive(Debug, Error)]
pub enum ShippingGroupError {
    #[error("Select at least one item for this delivery")]
    NoItemsSelected,

    #[error("Choose a shipping method for this delivery")]
    MissingShippingType,

    #[error("Address is incomplete: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("No address provided for this delivery")]
    NoAddress,

    #[error("Item {0} is not in this cart")]
    UnknownItem(CartItemId),

    #[error("Shipping group {0} not found")]
    NotFound(ShippingGroupId),

    #[error(transparent)]
    Commerce(#[from] CommerceError),
}

/// Where a new group's address comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AddressSource {
    /// Address typed into the form.
    Manual { address: Address },
    /// Address saved on the signed-in account.
    Saved { address_id: AddressId },
}

/// Input for [`ShippingGroupManager::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateShippingGroup {
    #[serde(default)]
    pub items: Vec<CartItemId>,
    #[serde(default)]
    pub address: Option<AddressSource>,
    #[serde(default)]
    pub shipping_type: String,
    #[serde(default)]
    pub delivery_estimate: Option<DeliveryEstimate>,
    #[serde(default)]
    pub shipping_price: Option<ShippingPrice>,
}

/// A shipping group with the cart items that reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingGroupView {
    #[serde(flatten)]
    pub group: ShippingGroup,
    pub items: Vec<CartItem>,
}

/// Every group of a cart plus the items not assigned to any of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingGroupsOverview {
    pub groups: Vec<ShippingGroupView>,
    pub unassigned: Vec<CartItem>,
}

impl ShippingGroupsOverview {
    /// Cross-reference groups against the live cart items.
    ///
    /// Items pointing at a group that no longer exists are reported as unassigned.
    #[must_use]
    pub fn build(cart: &Cart, groups: Vec<ShippingGroup>) -> Self {
        let known: HashSet<&ShippingGroupId> = groups.iter().map(|g| &g.id).collect();

        let unassigned = cart
            .shippable_items()
            .filter(|item| {
                item.shipping_group_id
                    .as_ref()
                    .is_none_or(|id| !known.contains(id))
            })
            .cloned()
            .collect();

        let groups = groups
            .into_iter()
            .map(|group| {
                let items = cart
                    .items
                    .iter()
                    .filter(|item| item.shipping_group_id.as_ref() == Some(&group.id))
                    .cloned()
                    .collect();
                ShippingGroupView { group, items }
            })
            .collect();

        Self { groups, unassigned }
    }
}

/// Whether the shopper may continue past the delivery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryProgress {
    /// Items that need a destination (promotions and the shipping line excluded).
    pub total_items: usize,
    pub assigned_items: usize,
    pub unassigned_items: usize,
    /// True iff no shippable item lacks a shipping-group reference.
    pub can_continue: bool,
}

impl DeliveryProgress {
    /// Compute progress over a cart's items.
    #[must_use]
    pub fn from_items(items: &[CartItem]) -> Self {
        let shippable: Vec<_> = items.iter().filter(|item| item.needs_delivery()).collect();
        let unassigned = shippable
            .iter()
            .filter(|item| item.shipping_group_id.is_none())
            .count();

        Self {
            total_items: shippable.len(),
            assigned_items: shippable.len() - unassigned,
            unassigned_items: unassigned,
            can_continue: unassigned == 0,
        }
    }
}

/// A reference change that was applied and can be undone.
struct AppliedUpdate {
    item_id: CartItemId,
    quantity: u32,
    previous: Option<ShippingGroupId>,
}

/// Maintains the partition of cart items into shipping groups.
#[derive(Clone)]
pub struct ShippingGroupManager {
    commerce: Arc<dyn CommerceApi>,
    cache: CartCache,
}

impl ShippingGroupManager {
    #[must_use]
    pub fn new(commerce: Arc<dyn CommerceApi>, cache: CartCache) -> Self {
        Self { commerce, cache }
    }

    /// Load the groups of a cart with their member items.
    ///
    /// # Errors
    ///
    /// Returns the platform error if the cart or its groups cannot be loaded.
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    pub async fn list(&self, cart_id: &CartId) -> Result<ShippingGroupsOverview, ShippingGroupError> {
        let cart = self.cache.get_or_load(self.commerce.as_ref(), cart_id).await?;
        let groups = self.commerce.list_shipping_groups(cart_id).await?;
        Ok(ShippingGroupsOverview::build(&cart, groups))
    }

    /// Report how many shippable items still need a destination.
    ///
    /// # Errors
    ///
    /// Returns the platform error if the cart cannot be loaded.
    #[instrument(skip(self), fields(cart_id = %cart_id))]
    pub async fn delivery_progress(
        &self,
        cart_id: &CartId,
    ) -> Result<DeliveryProgress, ShippingGroupError> {
        let cart = self.cache.get_or_load(self.commerce.as_ref(), cart_id).await?;
        Ok(DeliveryProgress::from_items(&cart.items))
    }

    /// Create a group and move the selected items into it.
    ///
    /// Item references are updated concurrently. If any update fails, the updates
    /// that succeeded are reverted and the new group is deleted before the error
    /// is returned. Groups left without items by the move are deleted.
    ///
    /// # Errors
    ///
    /// Returns a validation error before any request is sent, or the first
    /// platform error encountered.
    #[instrument(skip(self, input, credential), fields(cart_id = %cart_id, items = input.items.len()))]
    pub async fn create(
        &self,
        cart_id: &CartId,
        input: CreateShippingGroup,
        credential: Option<&AccountCredential>,
    ) -> Result<ShippingGroupView, ShippingGroupError> {
        let selected: BTreeSet<CartItemId> = input.items.into_iter().collect();
        if selected.is_empty() {
            return Err(ShippingGroupError::NoItemsSelected);
        }
        let shipping_type = input.shipping_type.trim().to_string();
        if shipping_type.is_empty() {
            return Err(ShippingGroupError::MissingShippingType);
        }

        let address = self.resolve_address(input.address, credential).await?;

        let cart = self.commerce.get_cart(cart_id).await?;
        let mut planned = Vec::with_capacity(selected.len());
        for item_id in &selected {
            let item = cart
                .item(item_id)
                .filter(|item| item.needs_delivery())
                .ok_or_else(|| ShippingGroupError::UnknownItem(item_id.clone()))?;
            planned.push(AppliedUpdate {
                item_id: item.id.clone(),
                quantity: item.quantity,
                previous: item.shipping_group_id.clone(),
            });
        }

        let group = self
            .commerce
            .create_shipping_group(
                cart_id,
                &NewShippingGroup {
                    shipping_type,
                    address,
                    delivery_estimate: input.delivery_estimate,
                    shipping_price: input.shipping_price,
                },
            )
            .await?;
        info!(group_id = %group.id, "Created shipping group");

        let updates: Vec<_> = planned
            .iter()
            .map(|update| {
                (
                    update.item_id.clone(),
                    CartItemUpdate {
                        quantity: update.quantity,
                        shipping_group_id: Some(group.id.clone()),
                    },
                )
            })
            .collect();
        let results = self.apply(cart_id, &updates).await;

        let mut applied = Vec::new();
        let mut items = Vec::new();
        let mut failure = None;
        for (update, result) in planned.into_iter().zip(results) {
            match result {
                Ok(item) => {
                    items.push(item);
                    applied.push(update);
                }
                Err(e) => {
                    warn!(item_id = %update.item_id, error = %e, "Shipping group assignment failed");
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            self.revert(cart_id, &applied).await;
            if let Err(cleanup) = self.commerce.delete_shipping_group(cart_id, &group.id).await {
                error!(group_id = %group.id, error = %cleanup, "Failed to delete group after rollback");
            }
            self.cache.invalidate(cart_id).await;
            return Err(e.into());
        }

        let vacated: BTreeSet<ShippingGroupId> = applied
            .iter()
            .filter_map(|u| u.previous.clone())
            .filter(|previous| previous != &group.id)
            .collect();
        self.delete_if_empty(cart_id, vacated).await;

        self.cache.invalidate(cart_id).await;
        Ok(ShippingGroupView { group, items })
    }

    /// Clear every member item's reference, then delete the group record.
    ///
    /// If clearing fails part way, cleared items are pointed back at the group
    /// and the group is kept.
    ///
    /// # Errors
    ///
    /// Returns [`ShippingGroupError::NotFound`] for an unknown group or the first
    /// platform error encountered.
    #[instrument(skip(self), fields(cart_id = %cart_id, group_id = %group_id))]
    pub async fn delete(
        &self,
        cart_id: &CartId,
        group_id: &ShippingGroupId,
    ) -> Result<(), ShippingGroupError> {
        let groups = self.commerce.list_shipping_groups(cart_id).await?;
        if !groups.iter().any(|g| &g.id == group_id) {
            return Err(ShippingGroupError::NotFound(group_id.clone()));
        }

        let cart = self.commerce.get_cart(cart_id).await?;
        let members: Vec<AppliedUpdate> = cart
            .items
            .iter()
            .filter(|item| item.shipping_group_id.as_ref() == Some(group_id))
            .map(|item| AppliedUpdate {
                item_id: item.id.clone(),
                quantity: item.quantity,
                previous: Some(group_id.clone()),
            })
            .collect();

        let updates: Vec<_> = members
            .iter()
            .map(|member| {
                (
                    member.item_id.clone(),
                    CartItemUpdate {
                        quantity: member.quantity,
                        shipping_group_id: None,
                    },
                )
            })
            .collect();
        let results = self.apply(cart_id, &updates).await;

        let mut cleared = Vec::new();
        let mut failure = None;
        for (member, result) in members.into_iter().zip(results) {
            match result {
                Ok(_) => cleared.push(member),
                Err(e) => {
                    warn!(item_id = %member.item_id, error = %e, "Clearing shipping group reference failed");
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            self.revert(cart_id, &cleared).await;
            self.cache.invalidate(cart_id).await;
            return Err(e.into());
        }

        let result = self.commerce.delete_shipping_group(cart_id, group_id).await;
        self.cache.invalidate(cart_id).await;
        result?;

        info!(items = cleared.len(), "Deleted shipping group");
        Ok(())
    }

    /// Point one item at an existing group.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown item or group, or the platform error.
    #[instrument(skip(self), fields(cart_id = %cart_id, item_id = %item_id, group_id = %group_id))]
    pub async fn attach_item(
        &self,
        cart_id: &CartId,
        item_id: &CartItemId,
        group_id: &ShippingGroupId,
    ) -> Result<CartItem, ShippingGroupError> {
        let groups = self.commerce.list_shipping_groups(cart_id).await?;
        if !groups.iter().any(|g| &g.id == group_id) {
            return Err(ShippingGroupError::NotFound(group_id.clone()));
        }

        self.reassign(cart_id, item_id, Some(group_id.clone())).await
    }

    /// Clear one item's group reference.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown item, or the platform error.
    #[instrument(skip(self), fields(cart_id = %cart_id, item_id = %item_id))]
    pub async fn remove_item(
        &self,
        cart_id: &CartId,
        item_id: &CartItemId,
    ) -> Result<CartItem, ShippingGroupError> {
        self.reassign(cart_id, item_id, None).await
    }

    async fn reassign(
        &self,
        cart_id: &CartId,
        item_id: &CartItemId,
        target: Option<ShippingGroupId>,
    ) -> Result<CartItem, ShippingGroupError> {
        let cart = self.commerce.get_cart(cart_id).await?;
        let item = cart
            .item(item_id)
            .filter(|item| target.is_none() || item.needs_delivery())
            .ok_or_else(|| ShippingGroupError::UnknownItem(item_id.clone()))?;
        let previous = item.shipping_group_id.clone();

        let result = self
            .commerce
            .update_cart_item(
                cart_id,
                item_id,
                &CartItemUpdate {
                    quantity: item.quantity,
                    shipping_group_id: target.clone(),
                },
            )
            .await;

        let updated = match result {
            Ok(updated) => updated,
            Err(e) => {
                self.cache.invalidate(cart_id).await;
                return Err(e.into());
            }
        };

        if let Some(previous) = previous.filter(|p| Some(p) != target.as_ref()) {
            self.delete_if_empty(cart_id, BTreeSet::from([previous]))
                .await;
        }

        self.cache.invalidate(cart_id).await;
        Ok(updated)
    }

    async fn resolve_address(
        &self,
        source: Option<AddressSource>,
        credential: Option<&AccountCredential>,
    ) -> Result<Address, ShippingGroupError> {
        let address = match source {
            Some(AddressSource::Manual { address }) => address,
            Some(AddressSource::Saved { address_id }) => {
                let credential = credential.ok_or(ShippingGroupError::NoAddress)?;
                self.commerce
                    .get_account_address(credential, &address_id)
                    .await?
                    .address
            }
            None => return Err(ShippingGroupError::NoAddress),
        };

        address.validate()?;
        Ok(address)
    }

    /// Send item reference updates concurrently. Results come back in input order.
    async fn apply(
        &self,
        cart_id: &CartId,
        updates: &[(CartItemId, CartItemUpdate)],
    ) -> Vec<Result<CartItem, CommerceError>> {
        join_all(
            updates
                .iter()
                .map(|(item_id, update)| self.commerce.update_cart_item(cart_id, item_id, update)),
        )
        .await
    }

    /// Point items back at the group they referenced before.
    async fn revert(&self, cart_id: &CartId, applied: &[AppliedUpdate]) {
        let updates: Vec<_> = applied
            .iter()
            .map(|update| {
                (
                    update.item_id.clone(),
                    CartItemUpdate {
                        quantity: update.quantity,
                        shipping_group_id: update.previous.clone(),
                    },
                )
            })
            .collect();
        let results = self.apply(cart_id, &updates).await;

        for (update, result) in applied.iter().zip(results) {
            if let Err(e) = result {
                error!(item_id = %update.item_id, error = %e, "Failed to restore shipping group reference");
            }
        }
    }

    /// Delete the given groups when no cart item references them any more.
    async fn delete_if_empty(&self, cart_id: &CartId, candidates: BTreeSet<ShippingGroupId>) {
        if candidates.is_empty() {
            return;
        }

        let cart = match self.commerce.get_cart(cart_id).await {
            Ok(cart) => cart,
            Err(e) => {
                warn!(error = %e, "Could not check for emptied shipping groups");
                return;
            }
        };

        for group_id in candidates {
            let in_use = cart
                .items
                .iter()
                .any(|item| item.shipping_group_id.as_ref() == Some(&group_id));
            if in_use {
                continue;
            }
            match self.commerce.delete_shipping_group(cart_id, &group_id).await {
                Ok(()) => info!(group_id = %group_id, "Deleted emptied shipping group"),
                Err(e) => warn!(group_id = %group_id, error = %e, "Failed to delete emptied shipping group"),
            }
        }
    }
}

impl std::fmt::Debug for ShippingGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShippingGroupManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use composable_core::{AccountId, AccountMemberId, AddressField};
    use secrecy::SecretString;

    use super::*;
    use crate::commerce::CartItemKind;
    use crate::testing::{FailPoint, InMemoryCommerce};

    fn address(city: &str) -> Address {
        Address {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            line_1: "1 Main St".into(),
            city: city.into(),
            postcode: "12345".into(),
            country: "US".into(),
            ..Address::default()
        }
    }

    fn manual(items: &[&str], city: &str) -> CreateShippingGroup {
        CreateShippingGroup {
            items: items.iter().map(|i| CartItemId::new(*i)).collect(),
            address: Some(AddressSource::Manual {
                address: address(city),
            }),
            shipping_type: "standard".into(),
            delivery_estimate: None,
            shipping_price: None,
        }
    }

    fn setup() -> (Arc<InMemoryCommerce>, ShippingGroupManager, CartId) {
        let commerce = Arc::new(InMemoryCommerce::new());
        let cart_id = commerce.seed_cart(&[("i1", 1, 1000), ("i2", 2, 500), ("i3", 1, 250)]);
        let manager = ShippingGroupManager::new(commerce.clone(), CartCache::new());
        (commerce, manager, cart_id)
    }

    fn assert_partition(commerce: &InMemoryCommerce, cart_id: &CartId) {
        let cart = commerce.cart(cart_id).unwrap();
        let groups = commerce.groups(cart_id);
        let known: HashSet<_> = groups.iter().map(|g| g.id.clone()).collect();
        for item in &cart.items {
            if let Some(group_id) = &item.shipping_group_id {
                assert!(known.contains(group_id), "item {} references deleted group", item.id);
            }
        }
    }

    #[tokio::test]
    async fn test_create_then_list_round_trip() {
        let (commerce, manager, cart_id) = setup();

        let view = manager
            .create(&cart_id, manual(&["i1", "i2"], "Springfield"), None)
            .await
            .unwrap();
        assert_eq!(view.items.len(), 2);

        let overview = manager.list(&cart_id).await.unwrap();
        assert_eq!(overview.groups.len(), 1);
        let group = &overview.groups[0];
        assert_eq!(group.group.address, address("Springfield"));
        let ids: BTreeSet<_> = group.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, BTreeSet::from(["i1", "i2"]));
        assert_eq!(overview.unassigned.len(), 1);
        assert_partition(&commerce, &cart_id);
    }

    #[tokio::test]
    async fn test_validation_sends_no_requests() {
        let (commerce, manager, cart_id) = setup();

        let err = manager
            .create(&cart_id, manual(&[], "Springfield"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShippingGroupError::NoItemsSelected));

        let mut input = manual(&["i1"], "");
        input.address = Some(AddressSource::Manual {
            address: Address {
                city: String::new(),
                postcode: String::new(),
                ..address("x")
            },
        });
        let err = manager.create(&cart_id, input, None).await.unwrap_err();
        match err {
            ShippingGroupError::InvalidAddress(e) => {
                assert_eq!(e.missing, vec![AddressField::City, AddressField::Postcode]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let mut input = manual(&["i1"], "Springfield");
        input.address = None;
        let err = manager.create(&cart_id, input, None).await.unwrap_err();
        assert!(matches!(err, ShippingGroupError::NoAddress));

        assert_eq!(commerce.calls_named("create_shipping_group"), 0);
        assert_eq!(commerce.calls_named("update_cart_item"), 0);
    }

    #[tokio::test]
    async fn test_saved_address_requires_account() {
        let (commerce, manager, cart_id) = setup();
        commerce.seed_account_address("acc-1", "addr-1", address("Shelbyville"));

        let mut input = manual(&["i1"], "Springfield");
        input.address = Some(AddressSource::Saved {
            address_id: AddressId::new("addr-1"),
        });
        let err = manager.create(&cart_id, input.clone(), None).await.unwrap_err();
        assert!(matches!(err, ShippingGroupError::NoAddress));

        let credential = AccountCredential {
            account_id: AccountId::new("acc-1"),
            account_name: None,
            member_id: AccountMemberId::new("mem-1"),
            token: SecretString::from("token"),
            expires_at: i64::MAX,
        };
        let view = manager
            .create(&cart_id, input, Some(&credential))
            .await
            .unwrap();
        assert_eq!(view.group.address.city, "Shelbyville");
    }

    #[tokio::test]
    async fn test_partial_failure_is_compensated() {
        let (commerce, manager, cart_id) = setup();
        let first = manager
            .create(&cart_id, manual(&["i1"], "Springfield"), None)
            .await
            .unwrap();

        commerce.fail_on(FailPoint::UpdateItem(CartItemId::new("i2")));
        let err = manager
            .create(&cart_id, manual(&["i1", "i2"], "Capital City"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShippingGroupError::Commerce(_)));

        let cart = commerce.cart(&cart_id).unwrap();
        let i1 = cart.item(&CartItemId::new("i1")).unwrap();
        assert_eq!(i1.shipping_group_id.as_ref(), Some(&first.group.id));
        assert!(cart.item(&CartItemId::new("i2")).unwrap().shipping_group_id.is_none());

        let groups = commerce.groups(&cart_id);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, first.group.id);
        assert_partition(&commerce, &cart_id);
    }

    #[tokio::test]
    async fn test_moving_all_items_deletes_emptied_group() {
        let (commerce, manager, cart_id) = setup();
        let first = manager
            .create(&cart_id, manual(&["i1"], "Springfield"), None)
            .await
            .unwrap();

        let second = manager
            .create(&cart_id, manual(&["i1", "i2"], "Capital City"), None)
            .await
            .unwrap();

        let groups = commerce.groups(&cart_id);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, second.group.id);
        assert_ne!(first.group.id, second.group.id);
        assert_partition(&commerce, &cart_id);
    }

    #[tokio::test]
    async fn test_delete_clears_references_before_deleting_group() {
        let (commerce, manager, cart_id) = setup();
        let view = manager
            .create(&cart_id, manual(&["i1", "i2"], "Springfield"), None)
            .await
            .unwrap();
        commerce.clear_calls();

        manager.delete(&cart_id, &view.group.id).await.unwrap();

        let calls = commerce.calls();
        let delete_at = calls
            .iter()
            .position(|c| c == "delete_shipping_group")
            .unwrap();
        let last_update = calls
            .iter()
            .rposition(|c| c == "update_cart_item")
            .unwrap();
        assert!(last_update < delete_at);

        let cart = commerce.cart(&cart_id).unwrap();
        assert!(cart.items.iter().all(|i| i.shipping_group_id.is_none()));
        assert!(commerce.groups(&cart_id).is_empty());
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_group_and_references() {
        let (commerce, manager, cart_id) = setup();
        let view = manager
            .create(&cart_id, manual(&["i1", "i2"], "Springfield"), None)
            .await
            .unwrap();

        commerce.fail_on(FailPoint::UpdateItem(CartItemId::new("i2")));
        assert!(manager.delete(&cart_id, &view.group.id).await.is_err());

        let cart = commerce.cart(&cart_id).unwrap();
        assert!(
            cart.items
                .iter()
                .filter(|i| i.id.as_str() != "i3")
                .all(|i| i.shipping_group_id.as_ref() == Some(&view.group.id))
        );
        assert_eq!(commerce.groups(&cart_id).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_unknown_group() {
        let (_commerce, manager, cart_id) = setup();
        let err = manager
            .delete(&cart_id, &ShippingGroupId::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShippingGroupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_last_item_deletes_group() {
        let (commerce, manager, cart_id) = setup();
        let view = manager
            .create(&cart_id, manual(&["i1"], "Springfield"), None)
            .await
            .unwrap();

        let item = manager
            .remove_item(&cart_id, &CartItemId::new("i1"))
            .await
            .unwrap();
        assert!(item.shipping_group_id.is_none());
        assert!(commerce.groups(&cart_id).iter().all(|g| g.id != view.group.id));
    }

    #[tokio::test]
    async fn test_attach_item_to_existing_group() {
        let (commerce, manager, cart_id) = setup();
        let view = manager
            .create(&cart_id, manual(&["i1"], "Springfield"), None)
            .await
            .unwrap();

        let item = manager
            .attach_item(&cart_id, &CartItemId::new("i3"), &view.group.id)
            .await
            .unwrap();
        assert_eq!(item.shipping_group_id.as_ref(), Some(&view.group.id));

        let err = manager
            .attach_item(&cart_id, &CartItemId::new("i3"), &ShippingGroupId::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShippingGroupError::NotFound(_)));
        assert_partition(&commerce, &cart_id);
    }

    #[tokio::test]
    async fn test_delivery_progress_gate() {
        let (commerce, manager, cart_id) = setup();
        commerce.add_item(&cart_id, "promo", CartItemKind::PromotionItem, -100);

        let progress = manager.delivery_progress(&cart_id).await.unwrap();
        assert_eq!(progress.total_items, 3);
        assert_eq!(progress.unassigned_items, 3);
        assert!(!progress.can_continue);

        manager
            .create(&cart_id, manual(&["i1", "i2"], "Springfield"), None)
            .await
            .unwrap();
        let progress = manager.delivery_progress(&cart_id).await.unwrap();
        assert_eq!(progress.unassigned_items, 1);
        assert!(!progress.can_continue);

        manager
            .create(&cart_id, manual(&["i3"], "Shelbyville"), None)
            .await
            .unwrap();
        let progress = manager.delivery_progress(&cart_id).await.unwrap();
        assert_eq!(progress.unassigned_items, 0);
        assert!(progress.can_continue);
    }

    #[tokio::test]
    async fn test_shipping_line_needs_no_group() {
        let (commerce, manager, cart_id) = setup();
        commerce.add_item(&cart_id, "ship", CartItemKind::CustomItem, 599);
        commerce.set_item_sku(&cart_id, "ship", "__shipping_express");

        manager
            .create(&cart_id, manual(&["i1", "i2", "i3"], "Springfield"), None)
            .await
            .unwrap();

        let progress = manager.delivery_progress(&cart_id).await.unwrap();
        assert_eq!(progress.total_items, 3);
        assert!(progress.can_continue);
        assert!(manager.list(&cart_id).await.unwrap().unassigned.is_empty());

        let err = manager
            .create(&cart_id, manual(&["ship"], "Springfield"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShippingGroupError::UnknownItem(_)));

        let group_id = commerce.groups(&cart_id)[0].id.clone();
        let err = manager
            .attach_item(&cart_id, &CartItemId::new("ship"), &group_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ShippingGroupError::UnknownItem(_)));
    }

    #[test]
    fn test_overview_treats_dangling_reference_as_unassigned() {
        let mut cart = Cart {
            id: CartId::new("c"),
            name: String::new(),
            items: Vec::new(),
            total: None,
        };
        cart.items.push(CartItem {
            id: CartItemId::new("i1"),
            kind: CartItemKind::CartItem,
            name: "i1".into(),
            sku: None,
            quantity: 1,
            unit_price: composable_core::Money::zero(composable_core::CurrencyCode::usd()),
            shipping_group_id: Some(ShippingGroupId::new("gone")),
        });

        let overview = ShippingGroupsOverview::build(&cart, Vec::new());
        assert!(overview.groups.is_empty());
        assert_eq!(overview.unassigned.len(), 1);
    }
}
