//! Shipping: delivery methods and shipping groups.

mod delivery;
mod groups;
pub mod rates;

pub use delivery::{DeliveryMethodResolver, DeliveryOption, normalize};
pub use groups::{
    AddressSource, CreateShippingGroup, DeliveryProgress, ShippingGroupError,
    ShippingGroupManager, ShippingGroupView, ShippingGroupsOverview,
};
pub use rates::{HttpRateSource, RateSourceError, ShippingRateSource, StaticRateSource};
