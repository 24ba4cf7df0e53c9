//! Manifest assembly.
//!
//! Once every rendition of a job completed, writes the HLS master playlist
//! (and optionally a DASH MPD) referencing the variant outputs, then moves the
//! job to Completed.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use m3u8_rs::{parse_media_playlist_res, MasterPlaylist, MediaPlaylist, Resolution, VariantStream};
use tracing::info;

use vtrans_models::{
    dash_manifest_path, render_manifest_path, Job, RenditionStatus, VideoCodec,
};
use vtrans_storage::content_type_for;

use crate::context::TranscodeContext;
use crate::error::{WorkerError, WorkerResult};
use crate::ownership::OwnedJob;

/// A completed rendition as referenced by a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub resolution: String,
    pub width: u32,
    pub height: u32,
    pub bandwidth: u64,
    pub average_bandwidth: u64,
    pub codecs: String,
    /// Segments are fragmented MP4 rather than MPEG-TS
    pub fmp4: bool,
    /// Variant playlist location
    pub playlist: String,
    pub duration_secs: Option<f64>,
}

impl Variant {
    /// Directory holding the variant's playlist and segments.
    fn prefix(&self) -> &str {
        self.playlist
            .rsplit_once('/')
            .map_or("", |(dir, _)| dir)
    }
}

/// Variants of a job's completed renditions, ordered by bandwidth.
pub fn variants(job: &Job) -> WorkerResult<Vec<Variant>> {
    let mut variants = job
        .renditions
        .iter()
        .map(|r| {
            if r.status != RenditionStatus::Completed {
                return Err(WorkerError::internal(format!(
                    "rendition {} is {}",
                    r.resolution(),
                    r.status
                )));
            }
            let playlist = r.output_location.clone().ok_or_else(|| {
                WorkerError::internal(format!("rendition {} has no output", r.resolution()))
            })?;
            let profile = &r.profile;
            let average_bandwidth = profile.bandwidth();
            Ok(Variant {
                resolution: r.resolution().to_string(),
                width: profile.width,
                height: profile.height,
                // Encoder peak rate is the target plus 10%
                bandwidth: average_bandwidth + average_bandwidth / 10,
                average_bandwidth,
                codecs: profile.codec.manifest_codecs().to_string(),
                fmp4: profile.codec != VideoCodec::H264,
                playlist,
                duration_secs: r.duration_secs,
            })
        })
        .collect::<WorkerResult<Vec<_>>>()?;
    variants.sort_by_key(|v| v.bandwidth);
    Ok(variants)
}

/// Path of `to` relative to the directory `from_dir`. Both are `/`-separated
/// object keys.
pub fn relative_uri(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let target: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();

    let common = from
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = vec![".."; from.len() - common];
    parts.extend(&target[common..]);
    parts.join("/")
}

/// Directory part of an object key.
fn parent_dir(key: &str) -> &str {
    key.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// HLS master playlist for `variants`, with URIs relative to `manifest_dir`.
pub fn master_playlist(manifest_dir: &str, variants: &[Variant]) -> WorkerResult<Vec<u8>> {
    let playlist = MasterPlaylist {
        version: Some(if variants.iter().any(|v| v.fmp4) { 7 } else { 3 }),
        independent_segments: true,
        variants: variants
            .iter()
            .map(|v| VariantStream {
                uri: relative_uri(manifest_dir, &v.playlist),
                bandwidth: v.bandwidth,
                average_bandwidth: Some(v.average_bandwidth),
                codecs: Some(v.codecs.clone()),
                resolution: Some(Resolution {
                    width: u64::from(v.width),
                    height: u64::from(v.height),
                }),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    let mut out = Vec::new();
    playlist.write_to(&mut out)?;
    Ok(out)
}

/// Segments listed by a variant's HLS media playlist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantSegments {
    /// `#EXT-X-MAP` initialization segment
    pub init: Option<String>,
    /// Segment URI and duration in seconds
    pub segments: Vec<(String, f64)>,
}

impl VariantSegments {
    pub fn parse(key: &str, bytes: &[u8]) -> WorkerResult<Self> {
        let playlist = parse_media_playlist_res(bytes)
            .map_err(|_| WorkerError::InvalidPlaylist(key.to_string()))?;
        Ok(Self::from_playlist(&playlist))
    }

    fn from_playlist(playlist: &MediaPlaylist) -> Self {
        let init = playlist
            .segments
            .iter()
            .find_map(|s| s.map.as_ref())
            .map(|m| m.uri.clone())
            .or_else(|| playlist_level_map(playlist));
        Self {
            init,
            segments: playlist
                .segments
                .iter()
                .map(|s| (s.uri.clone(), f64::from(s.duration)))
                .collect(),
        }
    }

    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|(_, d)| d).sum()
    }
}

/// `#EXT-X-MAP` written ahead of the first segment, which the parser keeps
/// as an unknown playlist tag.
fn playlist_level_map(playlist: &MediaPlaylist) -> Option<String> {
    let rest = playlist
        .unknown_tags
        .iter()
        .rev()
        .find(|t| t.tag == "X-MAP")?
        .rest
        .as_deref()?;
    attribute(rest, "URI")
}

/// Value of `name` in an HLS attribute list, unquoted.
fn attribute(list: &str, name: &str) -> Option<String> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in list.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&list[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);

    parts.into_iter().find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Static DASH MPD listing each variant's segments.
///
/// `playlists` holds the segments of every variant, in the same order as
/// `variants`. Variants are grouped into one adaptation set per
/// container type.
pub fn dash_manifest(manifest_dir: &str, variants: &[Variant], playlists: &[VariantSegments]) -> String {
    let duration = playlists
        .iter()
        .map(VariantSegments::duration)
        .fold(0.0_f64, f64::max);

    let mut sets: BTreeMap<&str, Vec<(&Variant, &VariantSegments)>> = BTreeMap::new();
    for (variant, playlist) in variants.iter().zip(playlists) {
        let mime = if variant.fmp4 { "video/mp4" } else { "video/mp2t" };
        sets.entry(mime).or_default().push((variant, playlist));
    }

    let mut out = String::new();
    let _ = writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    let _ = writeln!(
        out,
        r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" profiles="urn:mpeg:dash:profile:full:2011" minBufferTime="PT2S" mediaPresentationDuration="PT{:.3}S">"#,
        duration
    );
    let _ = writeln!(out, r#"  <Period id="0" start="PT0S">"#);
    for (set_id, (mime, members)) in sets.iter().enumerate() {
        let _ = writeln!(
            out,
            r#"    <AdaptationSet id="{}" contentType="video" mimeType="{}" segmentAlignment="true">"#,
            set_id, mime
        );
        for (variant, playlist) in members {
            let base = relative_uri(manifest_dir, variant.prefix());
            let _ = writeln!(
                out,
                r#"      <Representation id="{}" bandwidth="{}" width="{}" height="{}" codecs="{}">"#,
                xml_escape(&variant.resolution),
                variant.bandwidth,
                variant.width,
                variant.height,
                xml_escape(&variant.codecs)
            );
            // Segment URIs already resolve against the MPD's own directory
            if !base.is_empty() {
                let _ = writeln!(out, "        <BaseURL>{}/</BaseURL>", xml_escape(&base));
            }
            let _ = writeln!(out, r#"        <SegmentList timescale="1000">"#);
            if let Some(init) = &playlist.init {
                let _ = writeln!(out, r#"          <Initialization sourceURL="{}"/>"#, xml_escape(init));
            }
            let _ = writeln!(out, "          <SegmentTimeline>");
            for (_, secs) in &playlist.segments {
                let _ = writeln!(out, r#"            <S d="{}"/>"#, (secs * 1000.0).round() as u64);
            }
            let _ = writeln!(out, "          </SegmentTimeline>");
            for (uri, _) in &playlist.segments {
                let _ = writeln!(out, r#"          <SegmentURL media="{}"/>"#, xml_escape(uri));
            }
            let _ = writeln!(out, "        </SegmentList>");
            let _ = writeln!(out, "      </Representation>");
        }
        let _ = writeln!(out, "    </AdaptationSet>");
    }
    let _ = writeln!(out, "  </Period>");
    let _ = writeln!(out, "</MPD>");
    out
}

pub struct ManifestAssembler {
    ctx: Arc<TranscodeContext>,
}

impl ManifestAssembler {
    pub fn new(ctx: Arc<TranscodeContext>) -> Self {
        Self { ctx }
    }

    /// Write the manifests of a fully completed job and complete it.
    pub async fn assemble(&self, owned: &OwnedJob) -> WorkerResult<Job> {
        let job = owned.snapshot().await;
        let variants = variants(&job)?;

        let manifest_path =
            render_manifest_path(&self.ctx.config.manifest_format, &job.tenant_id, &job.video_id);
        let manifest_dir = parent_dir(&manifest_path);

        let dash_path = if self.ctx.config.generate_dash_manifest {
            let mut playlists = Vec::with_capacity(variants.len());
            for variant in &variants {
                let bytes = self.ctx.blobs.get_bytes(&variant.playlist).await?;
                playlists.push(VariantSegments::parse(&variant.playlist, &bytes)?);
            }
            let path = dash_manifest_path(&manifest_path);
            let mpd = dash_manifest(manifest_dir, &variants, &playlists);
            self.ctx
                .blobs
                .put_bytes(mpd.into_bytes(), &path, content_type_for(&path))
                .await?;
            Some(path)
        } else {
            None
        };

        let master = master_playlist(manifest_dir, &variants)?;
        self.ctx
            .blobs
            .put_bytes(master, &manifest_path, content_type_for(&manifest_path))
            .await?;

        owned
            .mutate(|j| Ok(j.complete(manifest_path.clone(), dash_path.clone(), Utc::now())?))
            .await?;

        info!(
            job_id = %job.id,
            manifest = %manifest_path,
            dash = dash_path.as_deref().unwrap_or("-"),
            variants = variants.len(),
            "Manifest assembled"
        );
        Ok(owned.snapshot().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(resolution: &str, bandwidth: u64, fmp4: bool) -> Variant {
        Variant {
            resolution: resolution.to_string(),
            width: 1280,
            height: 720,
            bandwidth,
            average_bandwidth: bandwidth,
            codecs: "avc1.640028,mp4a.40.2".to_string(),
            fmp4,
            playlist: format!("videos/t1/v1/{}/index.m3u8", resolution),
            duration_secs: Some(10.0),
        }
    }

    #[test]
    fn test_relative_uri() {
        assert_eq!(
            relative_uri("videos/t1/v1", "videos/t1/v1/480p/index.m3u8"),
            "480p/index.m3u8"
        );
        assert_eq!(
            relative_uri("manifests/t1", "videos/t1/v1/480p/index.m3u8"),
            "../../videos/t1/v1/480p/index.m3u8"
        );
        assert_eq!(relative_uri("", "videos/a.m3u8"), "videos/a.m3u8");
    }

    fn parse_master(bytes: &[u8]) -> MasterPlaylist {
        m3u8_rs::parse_master_playlist_res(bytes).unwrap()
    }

    #[test]
    fn test_master_playlist_lists_variants() {
        let bytes = master_playlist(
            "videos/t1/v1",
            &[variant("480p", 1_500_000, false), variant("1080p", 5_000_000, false)],
        )
        .unwrap();
        assert!(bytes.starts_with(b"#EXTM3U"));

        let master = parse_master(&bytes);
        assert_eq!(master.version, Some(3));
        assert!(master.independent_segments);
        let uris: Vec<&str> = master.variants.iter().map(|v| v.uri.as_str()).collect();
        assert_eq!(uris, vec!["480p/index.m3u8", "1080p/index.m3u8"]);

        let first = &master.variants[0];
        assert_eq!(first.bandwidth, 1_500_000);
        assert_eq!(first.average_bandwidth, Some(1_500_000));
        assert_eq!(first.codecs.as_deref(), Some("avc1.640028,mp4a.40.2"));
        assert_eq!(
            first.resolution,
            Some(Resolution {
                width: 1280,
                height: 720
            })
        );
    }

    #[test]
    fn test_fmp4_variant_raises_version() {
        let bytes = master_playlist("videos/t1/v1", &[variant("720p", 3_000_000, true)]).unwrap();
        assert_eq!(parse_master(&bytes).version, Some(7));
    }

    #[test]
    fn test_parse_variant_segments() {
        let text = "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:6\n#EXT-X-MAP:URI=\"init,v1.mp4\"\n#EXTINF:6.000,\nseg_000.m4s\n#EXTINF:4.5,\nseg_001.m4s\n#EXT-X-ENDLIST\n";
        let parsed = VariantSegments::parse("videos/t1/v1/720p/index.m3u8", text.as_bytes()).unwrap();
        assert_eq!(parsed.init.as_deref(), Some("init,v1.mp4"));
        assert_eq!(
            parsed.segments,
            vec![("seg_000.m4s".to_string(), 6.0), ("seg_001.m4s".to_string(), 4.5)]
        );
        assert_eq!(parsed.duration(), 10.5);
    }

    #[test]
    fn test_unparsable_variant_playlist_is_an_error() {
        let err = VariantSegments::parse("videos/t1/v1/480p/index.m3u8", b"not a playlist").unwrap_err();
        assert!(err.to_string().contains("480p/index.m3u8"));
    }

    #[test]
    fn test_attribute_keeps_quoted_commas() {
        assert_eq!(
            attribute(r#"URI="a,b.mp4",BYTERANGE="720@0""#, "URI").as_deref(),
            Some("a,b.mp4")
        );
        assert_eq!(attribute(r#"BYTERANGE="720@0""#, "URI"), None);
    }

    fn ts_segments() -> VariantSegments {
        VariantSegments::parse(
            "index.m3u8",
            b"#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg_000.ts\n#EXTINF:4.0,\nseg_001.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap()
    }

    #[test]
    fn test_dash_manifest_segment_list() {
        let mpd = dash_manifest("videos/t1/v1", &[variant("480p", 1_500_000, false)], &[ts_segments()]);

        assert!(mpd.contains(r#"mediaPresentationDuration="PT10.000S""#));
        assert!(mpd.contains(r#"mimeType="video/mp2t""#));
        assert!(mpd.contains("<BaseURL>480p/</BaseURL>"));
        assert!(mpd.contains(r#"<S d="6000"/>"#));
        assert!(mpd.contains(r#"<SegmentURL media="seg_001.ts"/>"#));
        assert!(!mpd.contains("Initialization"));
    }

    #[test]
    fn test_dash_manifest_in_variant_directory_has_no_base_url() {
        let mpd = dash_manifest("videos/t1/v1/480p", &[variant("480p", 1_500_000, false)], &[ts_segments()]);

        assert!(!mpd.contains("BaseURL"));
        assert!(mpd.contains(r#"<SegmentURL media="seg_000.ts"/>"#));
    }

    #[test]
    fn test_variants_require_completed_renditions() {
        let job = Job::new(
            "v1",
            "t1",
            "/media/v1.mp4",
            &[vtrans_models::RenditionProfile::new("480p", 854, 480, 1400)],
        );
        assert!(variants(&job).is_err());
    }
}
