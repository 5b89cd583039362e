//! Image catalogue operations
//!
//! Thin read/delete calls layered straight on the provider — no session,
//! no state machine. Safe to run concurrently with anything else.

use kiln_cloud::{Image, MachineProvider, Result};

/// All images, ordered by creation time, oldest first.
pub async fn list_images(provider: &dyn MachineProvider) -> Result<Vec<Image>> {
    let mut images = provider.list_images().await?;
    images.sort_by_key(|i| i.created_at);
    Ok(images)
}

/// One image by id; `ImageNotFound` if absent.
pub async fn image_info(provider: &dyn MachineProvider, id: &str) -> Result<Image> {
    provider.get_image(id).await
}

/// Delete one image by id; `ImageNotFound` if absent, and the catalogue
/// is left unchanged.
pub async fn delete_image(provider: &dyn MachineProvider, id: &str) -> Result<()> {
    provider.delete_image(id).await
}
