//! Firmware manifests
//!
//! A [FirmwareManifest] is the ordered list of images which make up one
//! complete flashable firmware, along with the offset each one is written to.
//! Manifests are built by the [ManifestResolver] from either the local
//! firmware directory or a published [Release], and are thrown away after the
//! flash attempt they were built for.

use std::{
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
};

use log::debug;
use url::Url;

use crate::{catalog::Release, error::ManifestError, relay::Relay};

/// Second stage bootloader
pub const BOOTLOADER: &str = "bootloader.bin";
/// Partition table
pub const PARTITIONS: &str = "partitions.bin";
/// Application image
pub const FIRMWARE: &str = "firmware.bin";

/// Directory holding the bundled firmware images
pub const DEFAULT_FIRMWARE_DIR: &str = "firmware";

/// The chip family every Nautilus firmware is built for
pub const CHIP_FAMILY: &str = "ESP32-S3";

/// File names and offsets of a complete firmware, in write order
const LAYOUT: [(&str, u32); 3] = [(BOOTLOADER, 0x0), (PARTITIONS, 0x8000), (FIRMWARE, 0x1_0000)];

/// Where the bytes of a segment come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentSource {
    /// A file on the local file system
    Local(PathBuf),
    /// A URL, already routed through the relay
    Remote(Url),
}

impl Display for SegmentSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SegmentSource::Local(path) => write!(f, "{}", path.display()),
            SegmentSource::Remote(url) => write!(f, "{url}"),
        }
    }
}

/// A single image and the flash offset it is written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSegment {
    source: SegmentSource,
    offset: u32,
    name: &'static str,
}

impl FlashSegment {
    pub fn source(&self) -> &SegmentSource {
        &self.source
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// An ordered, immutable set of segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareManifest {
    chip_family: &'static str,
    segments: Vec<FlashSegment>,
}

impl FirmwareManifest {
    /// The segments, in the order they must be written
    pub fn segments(&self) -> &[FlashSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The chip family the firmware was built for
    pub fn chip_family(&self) -> &'static str {
        self.chip_family
    }
}

/// What the operator chose to flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection<'a> {
    /// The images in the local firmware directory
    Local,
    /// The assets of a published release
    Release(&'a Release),
}

/// Turns a [Selection] into a [FirmwareManifest]
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    firmware_dir: PathBuf,
    relay: Relay,
}

impl ManifestResolver {
    pub fn new(firmware_dir: impl Into<PathBuf>, relay: Relay) -> Self {
        ManifestResolver {
            firmware_dir: firmware_dir.into(),
            relay,
        }
    }

    pub fn firmware_dir(&self) -> &Path {
        &self.firmware_dir
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn resolve(&self, selection: Selection<'_>) -> Result<FirmwareManifest, ManifestError> {
        let segments = match selection {
            Selection::Local => LAYOUT
                .iter()
                .map(|(name, offset)| FlashSegment {
                    source: SegmentSource::Local(self.firmware_dir.join(name)),
                    offset: *offset,
                    name,
                })
                .collect(),
            Selection::Release(release) => self.release_segments(release)?,
        };

        Ok(FirmwareManifest {
            chip_family: CHIP_FAMILY,
            segments,
        })
    }

    fn release_segments(&self, release: &Release) -> Result<Vec<FlashSegment>, ManifestError> {
        let mut found = Vec::with_capacity(LAYOUT.len());
        let mut missing = Vec::new();

        for (name, offset) in LAYOUT {
            match release.asset(name) {
                Some(asset) => found.push((name, offset, asset)),
                None => missing.push(name),
            }
        }

        // Every asset has to be present before anything is routed
        if !missing.is_empty() {
            return Err(ManifestError::Incomplete {
                release: release.display_name().to_string(),
                missing,
            });
        }

        let mut segments = Vec::with_capacity(found.len());
        for (name, offset, asset) in found {
            let url = self.relay.route(&asset.download_url)?;
            debug!("Routing {name} through {url}");

            segments.push(FlashSegment {
                source: SegmentSource::Remote(url),
                offset,
                name,
            });
        }

        Ok(segments)
    }
}

impl Default for ManifestResolver {
    fn default() -> Self {
        ManifestResolver::new(DEFAULT_FIRMWARE_DIR, Relay::default())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::catalog::Asset;

    fn asset(tag: &str, name: &str) -> Asset {
        Asset {
            name: name.to_string(),
            download_url: Url::parse(&format!(
                "https://github.com/h-i-r/nautilus/releases/download/{tag}/{name}"
            ))
            .unwrap(),
        }
    }

    fn release(tag: &str, names: &[&str]) -> Release {
        Release {
            name: String::new(),
            tag: tag.to_string(),
            prerelease: false,
            assets: names.iter().map(|name| asset(tag, name)).collect(),
        }
    }

    fn offsets(manifest: &FirmwareManifest) -> Vec<u32> {
        manifest.segments().iter().map(FlashSegment::offset).collect()
    }

    #[test]
    fn local_manifest() {
        let resolver = ManifestResolver::default();
        let manifest = resolver.resolve(Selection::Local).unwrap();

        assert_eq!(manifest.chip_family(), "ESP32-S3");
        assert_eq!(offsets(&manifest), vec![0x0, 0x8000, 0x10000]);
        assert_eq!(
            manifest
                .segments()
                .iter()
                .map(|segment| segment.source().clone())
                .collect::<Vec<_>>(),
            vec![
                SegmentSource::Local(PathBuf::from("firmware/bootloader.bin")),
                SegmentSource::Local(PathBuf::from("firmware/partitions.bin")),
                SegmentSource::Local(PathBuf::from("firmware/firmware.bin")),
            ]
        );
    }

    #[test]
    fn release_manifest_is_routed_through_the_relay() {
        let resolver = ManifestResolver::default();
        // Asset order in the listing doesn't matter
        let release = release("v1.0.0", &["firmware.bin", "bootloader.bin", "partitions.bin"]);

        let manifest = resolver.resolve(Selection::Release(&release)).unwrap();

        assert_eq!(offsets(&manifest), vec![0x0, 0x8000, 0x10000]);
        assert_eq!(
            manifest
                .segments()
                .iter()
                .map(FlashSegment::name)
                .collect::<Vec<_>>(),
            vec![BOOTLOADER, PARTITIONS, FIRMWARE]
        );

        for segment in manifest.segments() {
            let SegmentSource::Remote(url) = segment.source() else {
                panic!("release segments must be remote");
            };
            assert!(url.as_str().starts_with(crate::relay::DEFAULT_RELAY));
            assert!(url
                .query_pairs()
                .any(|(key, value)| key == "url" && value.ends_with(segment.name())));
        }
    }

    #[test]
    fn incomplete_release_lists_every_missing_asset() {
        let resolver = ManifestResolver::default();
        let release = release("v0.9.0", &["bootloader.bin", "firmware.elf"]);

        let err = resolver.resolve(Selection::Release(&release)).unwrap_err();

        match err {
            ManifestError::Incomplete { release, missing } => {
                assert_eq!(release, "v0.9.0");
                assert_eq!(missing, vec![PARTITIONS, FIRMWARE]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn asset_names_must_match_exactly() {
        let resolver = ManifestResolver::default();
        let release = release(
            "v1.1.0",
            &["bootloader.bin", "partitions.bin", "Firmware.bin"],
        );

        assert!(matches!(
            resolver.resolve(Selection::Release(&release)),
            Err(ManifestError::Incomplete { .. })
        ));
    }

    #[test]
    fn foreign_download_urls_are_rejected() {
        let resolver = ManifestResolver::default();
        let mut release = release("v1.0.0", &["bootloader.bin", "partitions.bin", "firmware.bin"]);
        release.assets[2].download_url =
            Url::parse("https://example.com/nautilus/firmware.bin").unwrap();

        assert!(matches!(
            resolver.resolve(Selection::Release(&release)),
            Err(ManifestError::Relay(_))
        ));
    }
}
