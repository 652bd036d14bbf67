use std::path::Path;

use serde_yaml::Value;

use crate::model::ImageRef;

use super::ComposeError;

/// Name and image, without digest, normalized to an explicit tag.
fn comparable(image: &str) -> String {
    let mut image = ImageRef::parse(image);
    image.digest = None;
    image.normalized()
}

/// Find the service `image` was deployed from.
///
/// An explicit service label wins when the document has that service.
/// Otherwise services are matched on their `image:` value, exact matches
/// first, then substring matches, in document order.
pub fn resolve_service(
    text: &str,
    file: &Path,
    label: Option<&str>,
    image: &ImageRef,
) -> Result<String, ComposeError> {
    let doc: Value =
        serde_yaml::from_str(text).map_err(|e| ComposeError::Yaml(file.to_path_buf(), e))?;
    let services = doc
        .get("services")
        .and_then(Value::as_mapping)
        .ok_or_else(|| ComposeError::Patch(format!("{file:?} has no services mapping")))?;

    if let Some(label) = label {
        if services.contains_key(label) {
            return Ok(label.to_string());
        }
        log::warn!("Service {label} is not in {file:?}, matching by image instead");
    }

    let wanted = {
        let mut image = image.clone();
        image.digest = None;
        image.normalized()
    };
    let candidates: Vec<(&str, String)> = services
        .iter()
        .filter_map(|(name, service)| {
            let name = name.as_str()?;
            let image = service.get("image")?.as_str()?;
            Some((name, comparable(image)))
        })
        .collect();

    candidates
        .iter()
        .find(|(_, image)| *image == wanted)
        .or_else(|| {
            candidates
                .iter()
                .find(|(_, image)| image.contains(&wanted) || wanted.contains(image.as_str()))
        })
        .map(|(name, _)| name.to_string())
        .ok_or_else(|| ComposeError::ServiceNotFound {
            file: file.to_path_buf(),
            image: wanted,
        })
}
