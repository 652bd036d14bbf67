use std::collections::HashSet;

use crate::backup::{BackupRecord, BackupStore};
use crate::engine::ContainerEngine;
use crate::model::ImageRef;

/// Remove superseded images of `container_name` after a successful update.
///
/// Candidates are the image the container ran before and the images of
/// backup records that just aged out of retention. A candidate is kept when
/// it is the running target or when a retained backup record still carries
/// its tag, since a rollback would need it. Failures are only logged.
pub async fn prune_images(
    engine: &dyn ContainerEngine,
    backups: &dyn BackupStore,
    container_name: &str,
    previous: &str,
    target: &str,
    aged_out: &[BackupRecord],
) -> Vec<String> {
    let retained = match backups.list_by_name(container_name).await {
        Ok(records) => records,
        Err(e) => {
            log::warn!("Not pruning images of {container_name}: cannot read backups: {e}");
            return Vec::new();
        }
    };
    let retained_tags: HashSet<&str> = retained.iter().map(|r| r.image_tag.as_str()).collect();
    let target = ImageRef::parse(target).normalized();

    let mut candidates = vec![previous.to_string()];
    candidates.extend(aged_out.iter().map(BackupRecord::image_reference));

    let mut seen = HashSet::new();
    let mut removed = Vec::new();
    for candidate in candidates {
        let image = ImageRef::parse(&candidate);
        let reference = image.normalized();
        if !seen.insert(reference.clone()) || reference == target {
            continue;
        }
        if retained_tags.contains(image.tag_or_latest()) {
            log::debug!("Keeping {reference}: a retained backup of {container_name} needs it");
            continue;
        }
        match engine.remove_image(&reference).await {
            Ok(()) => {
                log::info!("Pruned image {reference}");
                removed.push(reference);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => log::warn!("Failed to prune image {reference}: {e}"),
        }
    }
    removed
}
