//! Output path templates.
//!
//! Templates use `{tenantId}`, `{videoId}` and `{resolution}` placeholders.
//! Rendered paths are deterministic so re-running a rendition overwrites the
//! same objects.

use crate::error::{ModelError, ModelResult};

pub const TENANT_ID: &str = "{tenantId}";
pub const VIDEO_ID: &str = "{videoId}";
pub const RESOLUTION: &str = "{resolution}";

/// Render the output location prefix for one rendition.
pub fn render_output_path(format: &str, tenant_id: &str, video_id: &str, resolution: &str) -> String {
    format
        .replace(TENANT_ID, tenant_id)
        .replace(VIDEO_ID, video_id)
        .replace(RESOLUTION, resolution)
        .trim_end_matches('/')
        .to_string()
}

/// Render the master manifest location for a video.
pub fn render_manifest_path(format: &str, tenant_id: &str, video_id: &str) -> String {
    format
        .replace(TENANT_ID, tenant_id)
        .replace(VIDEO_ID, video_id)
}

/// DASH manifest location next to the HLS master manifest.
pub fn dash_manifest_path(manifest_path: &str) -> String {
    let (dir, file) = match manifest_path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, manifest_path),
    };
    let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
    match dir {
        Some(dir) => format!("{}/{}.mpd", dir, stem),
        None => format!("{}.mpd", stem),
    }
}

/// Check a template contains every required placeholder.
pub fn validate_template(format: &str, required: &[&str]) -> ModelResult<()> {
    if format.trim().is_empty() {
        return Err(ModelError::invalid_template("template is empty"));
    }
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|p| !format.contains(p))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ModelError::invalid_template(format!(
            "'{}' is missing {}",
            format,
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_output_path() {
        let path = render_output_path("videos/{tenantId}/{videoId}/{resolution}/", "t1", "v1", "480p");
        assert_eq!(path, "videos/t1/v1/480p");
    }

    #[test]
    fn test_render_manifest_path() {
        let path = render_manifest_path("videos/{tenantId}/{videoId}/master.m3u8", "t1", "v1");
        assert_eq!(path, "videos/t1/v1/master.m3u8");
    }

    #[test]
    fn test_dash_manifest_path() {
        assert_eq!(dash_manifest_path("videos/t1/v1/master.m3u8"), "videos/t1/v1/master.mpd");
        assert_eq!(dash_manifest_path("master"), "master.mpd");
    }

    #[test]
    fn test_validate_template() {
        assert!(validate_template("{tenantId}/{videoId}", &[TENANT_ID, VIDEO_ID]).is_ok());
        let err = validate_template("{tenantId}/x", &[TENANT_ID, VIDEO_ID]).unwrap_err();
        assert!(err.to_string().contains("{videoId}"));
    }
}
