pub mod group;
pub mod group_permission;
pub mod identity;
pub mod identity_group;
pub mod identity_permission;

pub use group::Entity as Group;
pub use group_permission::Entity as GroupPermission;
pub use identity::Entity as Identity;
pub use identity_group::Entity as IdentityGroup;
pub use identity_permission::Entity as IdentityPermission;
