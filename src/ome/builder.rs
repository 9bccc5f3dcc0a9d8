//! Incremental OME-XML model.
//!
//! The builder keeps one series per stage position. Every written plane adds
//! a TiffData record (where the plane lives) and a Plane record (how it was
//! acquired). When an acquisition ends with holes in the grid, gap filling
//! adds TiffData records for the missing planes that point at the nearest
//! plane actually written, so OME readers always find a valid IFD.
//!
//! The builder never sees the engine; it works from a [`DatasetDescriptor`]
//! snapshot taken when the dataset was created.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::data::{Image, PixelType, SummaryMetadata};

use super::xml::XmlWriter;

/// OME schema namespace.
pub const OME_NAMESPACE: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06";

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

const MICRON: &str = "µm";

// =============================================================================
// DatasetDescriptor
// =============================================================================

/// Read-only snapshot of the dataset properties the OME model needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDescriptor {
    pub prefix: String,
    /// Intended channel count
    pub channels: u32,
    /// Intended slice count
    pub slices: u32,
    /// Intended frame count
    pub frames: u32,
    pub pixel_size_um: Option<f64>,
    pub z_step_um: Option<f64>,
    pub slices_first: bool,
    pub time_first: bool,
    pub channel_names: Vec<String>,
    /// 0xRRGGBB per channel
    pub channel_colors: Vec<u32>,
    pub comments: String,
    pub start_time: Option<DateTime<Utc>>,
    /// Byte order of the pixel data
    pub big_endian: bool,
}

impl DatasetDescriptor {
    /// Snapshot the parts of `summary` the OME model uses.
    pub fn from_summary(summary: &SummaryMetadata) -> Self {
        Self {
            prefix: summary.prefix.clone(),
            channels: summary.channels(),
            slices: summary.slices(),
            frames: summary.frames(),
            pixel_size_um: summary.pixel_size_um,
            z_step_um: summary.z_step_um,
            slices_first: summary.slices_first,
            time_first: summary.time_first,
            channel_names: summary.channel_names.clone(),
            channel_colors: summary.channel_colors.clone(),
            comments: summary.comments.clone(),
            start_time: summary.start_time,
            big_endian: false,
        }
    }

    /// `XYZCT` when slices vary fastest, otherwise `XYCZT`.
    pub fn dimension_order(&self) -> &'static str {
        if self.slices_first {
            "XYZCT"
        } else {
            "XYCZT"
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Physical location of a plane: file, its UUID and the IFD index in it.
#[derive(Debug, Clone, Copy)]
pub struct FileRef<'a> {
    pub file_name: &'a str,
    pub uuid: &'a str,
    pub ifd: u32,
}

/// A TiffData element: which IFD of which file holds plane (C, Z, T).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiffDataRecord {
    pub ifd: u32,
    pub channel: u32,
    pub z: u32,
    pub time: u32,
    pub file_name: String,
    pub uuid: String,
    /// Added by gap filling; points at another plane's IFD
    pub synthesized: bool,
}

/// A Plane element: acquisition details of one written plane.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneRecord {
    pub channel: u32,
    pub z: u32,
    pub time: u32,
    pub delta_t_ms: Option<f64>,
    pub exposure_ms: Option<f64>,
    pub x_um: Option<f64>,
    pub y_um: Option<f64>,
    pub z_um: Option<f64>,
}

type PlaneKey = (u32, u32, u32);

/// OME Image (series) for one stage position.
#[derive(Debug, Clone)]
pub struct OmeSeries {
    position: u32,
    name: String,
    pixel_type: PixelType,
    width: u32,
    height: u32,
    size_c: u32,
    size_z: u32,
    size_t: u32,
    stage: (Option<f64>, Option<f64>, Option<f64>),
    camera: Option<String>,
    tiff_data: Vec<TiffDataRecord>,
    planes: Vec<PlaneRecord>,
    /// (c, z, t) of real planes -> index into `tiff_data`
    written: HashMap<PlaneKey, usize>,
    /// Every (c, z, t) with a TiffData record, real, blank or synthesized
    covered: HashSet<PlaneKey>,
    last_frame: u32,
}

impl OmeSeries {
    fn new(position: u32, image: &Image, descriptor: &DatasetDescriptor) -> Self {
        let tags = image.tags();
        Self {
            position,
            name: tags
                .position_name
                .clone()
                .unwrap_or_else(|| format!("Pos{position}")),
            pixel_type: image.pixel_type(),
            width: image.width(),
            height: image.height(),
            size_c: descriptor.channels,
            size_z: descriptor.slices,
            size_t: descriptor.frames,
            stage: (tags.x_um, tags.y_um, tags.z_um),
            camera: tags.camera.clone(),
            tiff_data: Vec::new(),
            planes: Vec::new(),
            written: HashMap::new(),
            covered: HashSet::new(),
            last_frame: 0,
        }
    }

    fn grow_to(&mut self, c: u32, z: u32, t: u32) {
        self.size_c = self.size_c.max(c + 1);
        self.size_z = self.size_z.max(z + 1);
        self.size_t = self.size_t.max(t + 1);
        self.last_frame = self.last_frame.max(t);
    }

    fn push_tiff_data(&mut self, key: PlaneKey, file: FileRef<'_>, synthesized: bool) -> usize {
        let (channel, z, time) = key;
        self.tiff_data.push(TiffDataRecord {
            ifd: file.ifd,
            channel,
            z,
            time,
            file_name: file.file_name.to_string(),
            uuid: file.uuid.to_string(),
            synthesized,
        });
        self.covered.insert(key);
        self.tiff_data.len() - 1
    }

    /// Nearest written plane of the same channel that can stand in for
    /// `(c, z, t)`.
    ///
    /// Searches frame `t` at slice distances 1, 2, ... (below before above),
    /// then earlier frames from distance 0.
    fn find_donor(&self, c: u32, z: u32, t: u32) -> Option<usize> {
        for frame in (0..=t).rev() {
            let first = if frame == t { 1 } else { 0 };
            for distance in first..self.size_z.max(1) {
                if distance <= z {
                    if let Some(&i) = self.written.get(&(c, z - distance, frame)) {
                        return Some(i);
                    }
                }
                if distance > 0 && z + distance < self.size_z {
                    if let Some(&i) = self.written.get(&(c, z + distance, frame)) {
                        return Some(i);
                    }
                }
            }
        }
        None
    }

    /// Stage position index of this series.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Series name (stage label).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `(SizeC, SizeZ, SizeT)`.
    pub fn sizes(&self) -> (u32, u32, u32) {
        (self.size_c, self.size_z, self.size_t)
    }

    /// Highest frame index written.
    pub fn last_frame(&self) -> u32 {
        self.last_frame
    }

    /// TiffData records in insertion order.
    pub fn tiff_data(&self) -> &[TiffDataRecord] {
        &self.tiff_data
    }

    /// Plane records in insertion order.
    pub fn planes(&self) -> &[PlaneRecord] {
        &self.planes
    }

    /// TiffData record covering `(c, z, t)`, if any.
    pub fn tiff_data_for(&self, c: u32, z: u32, t: u32) -> Option<&TiffDataRecord> {
        self.tiff_data
            .iter()
            .find(|r| r.channel == c && r.z == z && r.time == t)
    }
}

// =============================================================================
// OmeMetadataBuilder
// =============================================================================

/// Accumulates OME metadata as planes are written.
#[derive(Debug, Clone)]
pub struct OmeMetadataBuilder {
    descriptor: DatasetDescriptor,
    series: BTreeMap<u32, OmeSeries>,
}

impl OmeMetadataBuilder {
    /// Create an empty model.
    pub fn new(descriptor: DatasetDescriptor) -> Self {
        Self {
            descriptor,
            series: BTreeMap::new(),
        }
    }

    /// Descriptor snapshot this model was built from.
    pub fn descriptor(&self) -> &DatasetDescriptor {
        &self.descriptor
    }

    /// Record a written plane.
    pub fn add_image(&mut self, image: &Image, file: FileRef<'_>) {
        let coords = image.coords();
        let (c, z, t) = (coords.channel(), coords.z(), coords.time());
        let position = coords.position();

        let descriptor = &self.descriptor;
        let series = self
            .series
            .entry(position)
            .or_insert_with(|| OmeSeries::new(position, image, descriptor));
        series.grow_to(c, z, t);

        let index = series.push_tiff_data((c, z, t), file, false);
        series.written.insert((c, z, t), index);

        let tags = image.tags();
        series.planes.push(PlaneRecord {
            channel: c,
            z,
            time: t,
            delta_t_ms: tags.elapsed_ms,
            exposure_ms: tags.exposure_ms,
            x_um: tags.x_um,
            y_um: tags.y_um,
            z_um: tags.z_um,
        });
    }

    /// Record a blank padding plane. It gets a TiffData record but no Plane
    /// record, and is never used as a gap-filling donor.
    pub fn add_blank_plane(&mut self, position: u32, c: u32, z: u32, t: u32, file: FileRef<'_>) {
        if let Some(series) = self.series.get_mut(&position) {
            series.grow_to(c, z, t);
            series.push_tiff_data((c, z, t), file, false);
        }
    }

    /// Set SizeT of a series.
    pub fn set_num_frames(&mut self, position: u32, frames: u32) {
        if let Some(series) = self.series.get_mut(&position) {
            series.size_t = frames.max(1);
        }
    }

    /// Add synthesized TiffData records for every (slice, channel) of `frame`
    /// that has none. Returns the number of records added.
    pub fn fill_in_missing_tiff_datas(&mut self, frame: u32, position: u32) -> usize {
        let Some(series) = self.series.get_mut(&position) else {
            return 0;
        };

        let mut added = 0;
        for z in 0..series.size_z {
            for c in 0..series.size_c {
                if series.covered.contains(&(c, z, frame)) {
                    continue;
                }
                let Some(donor) = series.find_donor(c, z, frame) else {
                    continue;
                };
                let donor = series.tiff_data[donor].clone();
                series.push_tiff_data(
                    (c, z, frame),
                    FileRef {
                        file_name: &donor.file_name,
                        uuid: &donor.uuid,
                        ifd: donor.ifd,
                    },
                    true,
                );
                added += 1;
            }
        }
        added
    }

    /// Trim every series to the frames actually reached and fill gaps in each
    /// of them. Returns the number of synthesized records.
    pub fn complete(&mut self) -> usize {
        let positions: Vec<(u32, u32)> = self
            .series
            .values()
            .map(|s| (s.position, s.last_frame))
            .collect();

        let mut added = 0;
        for (position, last_frame) in positions {
            self.set_num_frames(position, last_frame + 1);
            for frame in 0..=last_frame {
                added += self.fill_in_missing_tiff_datas(frame, position);
            }
        }
        added
    }

    /// Series for a stage position.
    pub fn series(&self, position: u32) -> Option<&OmeSeries> {
        self.series.get(&position)
    }

    /// Number of series.
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    // -------------------------------------------------------------------------
    // Serialization
    // -------------------------------------------------------------------------

    fn root_attrs(uuid: &str) -> Vec<(&'static str, String)> {
        vec![
            ("xmlns", OME_NAMESPACE.to_string()),
            ("xmlns:xsi", XSI_NAMESPACE.to_string()),
            (
                "xsi:schemaLocation",
                format!("{OME_NAMESPACE} {OME_NAMESPACE}/ome.xsd"),
            ),
            ("UUID", uuid.to_string()),
            (
                "Creator",
                format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            ),
        ]
    }

    /// Render the full document. `root_uuid` is the UUID of the file that
    /// will hold it.
    pub fn to_xml(&self, root_uuid: &str) -> String {
        let d = &self.descriptor;
        let mut w = XmlWriter::with_declaration();
        w.start("OME", &Self::root_attrs(root_uuid));

        for (i, series) in self.series.values().enumerate() {
            if let Some(camera) = &series.camera {
                w.start("Instrument", &[("ID", format!("Instrument:{i}"))])
                    .empty(
                        "Detector",
                        &[("ID", format!("Detector:{i}:0")), ("Model", camera.clone())],
                    )
                    .end();
            }
        }

        for (i, series) in self.series.values().enumerate() {
            w.start(
                "Image",
                &[("ID", format!("Image:{i}")), ("Name", series.name.clone())],
            );

            if let Some(start) = d.start_time {
                w.text_element(
                    "AcquisitionDate",
                    &[],
                    &start.to_rfc3339_opts(SecondsFormat::Secs, true),
                );
            }
            if !d.comments.is_empty() {
                w.text_element("Description", &[], &d.comments);
            }
            if series.camera.is_some() {
                w.empty("InstrumentRef", &[("ID", format!("Instrument:{i}"))]);
            }

            let (sx, sy, sz) = series.stage;
            if sx.is_some() || sy.is_some() || sz.is_some() {
                let mut attrs = vec![("Name", series.name.clone())];
                push_length(&mut attrs, "X", "XUnit", sx);
                push_length(&mut attrs, "Y", "YUnit", sy);
                push_length(&mut attrs, "Z", "ZUnit", sz);
                w.empty("StageLabel", &attrs);
            }

            let rgb = series.pixel_type == PixelType::Rgb24;
            let mut pixels = vec![
                ("ID", format!("Pixels:{i}")),
                ("DimensionOrder", d.dimension_order().to_string()),
                ("Type", series.pixel_type.ome_type().to_string()),
                ("SizeX", series.width.to_string()),
                ("SizeY", series.height.to_string()),
                ("SizeZ", series.size_z.to_string()),
                ("SizeC", series.size_c.to_string()),
                ("SizeT", series.size_t.to_string()),
                ("BigEndian", d.big_endian.to_string()),
                ("Interleaved", rgb.to_string()),
                (
                    "SignificantBits",
                    series.pixel_type.bits_per_sample().to_string(),
                ),
            ];
            push_length(&mut pixels, "PhysicalSizeX", "PhysicalSizeXUnit", d.pixel_size_um);
            push_length(&mut pixels, "PhysicalSizeY", "PhysicalSizeYUnit", d.pixel_size_um);
            push_length(&mut pixels, "PhysicalSizeZ", "PhysicalSizeZUnit", d.z_step_um);
            w.start("Pixels", &pixels);

            for c in 0..series.size_c {
                let idx = c as usize;
                let mut attrs = vec![
                    ("ID", format!("Channel:{i}:{c}")),
                    ("SamplesPerPixel", series.pixel_type.samples_per_pixel().to_string()),
                ];
                if let Some(name) = d.channel_names.get(idx) {
                    attrs.push(("Name", name.clone()));
                }
                if let Some(&rgb) = d.channel_colors.get(idx) {
                    attrs.push(("Color", ome_color(rgb).to_string()));
                }
                if series.camera.is_some() {
                    w.start("Channel", &attrs)
                        .empty("DetectorSettings", &[("ID", format!("Detector:{i}:0"))])
                        .end();
                } else {
                    w.empty("Channel", &attrs);
                }
            }

            for td in &series.tiff_data {
                w.start(
                    "TiffData",
                    &[
                        ("IFD", td.ifd.to_string()),
                        ("FirstC", td.channel.to_string()),
                        ("FirstZ", td.z.to_string()),
                        ("FirstT", td.time.to_string()),
                        ("PlaneCount", "1".to_string()),
                    ],
                )
                .text_element("UUID", &[("FileName", td.file_name.clone())], &td.uuid)
                .end();
            }

            for plane in &series.planes {
                let mut attrs = vec![
                    ("TheC", plane.channel.to_string()),
                    ("TheZ", plane.z.to_string()),
                    ("TheT", plane.time.to_string()),
                ];
                if let Some(dt) = plane.delta_t_ms {
                    attrs.push(("DeltaT", dt.to_string()));
                    attrs.push(("DeltaTUnit", "ms".to_string()));
                }
                if let Some(exposure) = plane.exposure_ms {
                    attrs.push(("ExposureTime", exposure.to_string()));
                    attrs.push(("ExposureTimeUnit", "ms".to_string()));
                }
                push_length(&mut attrs, "PositionX", "PositionXUnit", plane.x_um);
                push_length(&mut attrs, "PositionY", "PositionYUnit", plane.y_um);
                push_length(&mut attrs, "PositionZ", "PositionZUnit", plane.z_um);
                w.empty("Plane", &attrs);
            }

            w.end(); // Pixels
            w.end(); // Image
        }

        w.finish()
    }

    /// Stub document for files that do not hold the full metadata.
    pub fn pointer_document(own_uuid: &str, holder_file: &str, holder_uuid: &str) -> String {
        let mut w = XmlWriter::with_declaration();
        w.start("OME", &Self::root_attrs(own_uuid)).empty(
            "BinaryOnly",
            &[
                ("MetadataFile", holder_file.to_string()),
                ("UUID", holder_uuid.to_string()),
            ],
        );
        w.finish()
    }
}

fn push_length(
    attrs: &mut Vec<(&'static str, String)>,
    key: &'static str,
    unit_key: &'static str,
    value: Option<f64>,
) {
    if let Some(v) = value {
        attrs.push((key, v.to_string()));
        attrs.push((unit_key, MICRON.to_string()));
    }
}

/// OME colors are signed 32-bit RGBA.
fn ome_color(rgb: u32) -> i32 {
    (((rgb & 0xFF_FF_FF) << 8) | 0xFF) as i32
}

/// Extract `MetadataFile` and `UUID` from a `BinaryOnly` pointer document.
pub fn parse_pointer_document(xml: &str) -> Option<(String, String)> {
    let start = xml.find("<BinaryOnly")?;
    let element = &xml[start..];
    let element = &element[..element.find('>')?];
    Some((attribute(element, "MetadataFile")?, attribute(element, "UUID")?))
}

fn attribute(element: &str, name: &str) -> Option<String> {
    let key = format!(" {name}=\"");
    let start = element.find(&key)? + key.len();
    let end = element[start..].find('"')? + start;
    Some(
        element[start..end]
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&"),
    )
}
