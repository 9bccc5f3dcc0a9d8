//! OME-XML metadata generation.

mod builder;
mod xml;

pub use builder::{
    parse_pointer_document, DatasetDescriptor, FileRef, OmeMetadataBuilder, OmeSeries,
    PlaneRecord, TiffDataRecord, OME_NAMESPACE,
};
pub use xml::{escape, XmlWriter};
