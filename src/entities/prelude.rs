pub use super::files::Entity as Files;
