//! Contains a reader for the compiled (binary XML) `AndroidManifest.xml` of an
//! APK. Only the identity attributes shown by `info` are decoded.
use thiserror::Error;

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;

const UTF8_FLAG: u32 = 0x0000_0100;
const NO_ENTRY: u32 = 0xFFFF_FFFF;

const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;

// android:versionCode, android:versionName, android:minSdkVersion
const ATTR_VERSION_CODE: u32 = 0x0101_021b;
const ATTR_VERSION_NAME: u32 = 0x0101_021c;
const ATTR_MIN_SDK_VERSION: u32 = 0x0101_020c;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("not a binary XML document")]
    NotBinaryXml,
    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),
    #[error("malformed binary XML: {0}")]
    Malformed(&'static str),
}

type ParseResult<T> = std::result::Result<T, ManifestError>;

/// Identity of a package as declared by its manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestInfo {
    pub package: Option<String>,
    pub version_code: Option<String>,
    pub version_name: Option<String>,
    pub min_sdk_version: Option<String>,
}

struct ChunkHeader {
    start: usize,
    chunk_type: u16,
    header_size: usize,
    size: usize,
}

impl ChunkHeader {
    fn read(data: &[u8], start: usize) -> ParseResult<Self> {
        let header = ChunkHeader {
            start,
            chunk_type: read_u16(data, start)?,
            header_size: read_u16(data, start + 2)? as usize,
            size: read_u32(data, start + 4)? as usize,
        };
        if header.header_size < 8 || header.size < header.header_size {
            return Err(ManifestError::Malformed("chunk smaller than its header"));
        }
        Ok(header)
    }

    fn end(&self) -> usize {
        self.start + self.size
    }

    fn body(&self) -> usize {
        self.start + self.header_size
    }
}

fn read_u8(data: &[u8], at: usize) -> ParseResult<u8> {
    data.get(at).copied().ok_or(ManifestError::Truncated(at))
}

fn read_u16(data: &[u8], at: usize) -> ParseResult<u16> {
    match data.get(at..at + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(ManifestError::Truncated(at)),
    }
}

fn read_u32(data: &[u8], at: usize) -> ParseResult<u32> {
    match data.get(at..at + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(ManifestError::Truncated(at)),
    }
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(data: &[u8], header: &ChunkHeader) -> ParseResult<Self> {
        let count = read_u32(data, header.start + 8)? as usize;
        let flags = read_u32(data, header.start + 16)?;
        let strings_start = header.start + read_u32(data, header.start + 20)? as usize;
        let utf8 = flags & UTF8_FLAG != 0;
        if count > data.len() / 4 {
            return Err(ManifestError::Malformed("string count exceeds document"));
        }
        let mut strings = Vec::with_capacity(count);
        for i in 0..count {
            let offset = strings_start + read_u32(data, header.body() + i * 4)? as usize;
            let value = if utf8 { read_utf8_string(data, offset)? } else { read_utf16_string(data, offset)? };
            strings.push(value);
        }
        Ok(StringPool { strings })
    }

    fn get(&self, index: u32) -> Option<&str> {
        if index == NO_ENTRY {
            return None;
        }
        self.strings.get(index as usize).map(String::as_str)
    }
}

/// UTF-8 pool lengths take one byte, or two when the high bit is set.
fn read_utf8_length(data: &[u8], at: usize) -> ParseResult<(usize, usize)> {
    let first = read_u8(data, at)?;
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }
    let second = read_u8(data, at + 1)?;
    Ok(((((first & 0x7F) as usize) << 8) | second as usize, 2))
}

fn read_utf8_string(data: &[u8], at: usize) -> ParseResult<String> {
    // character count, then byte count
    let (_, skip) = read_utf8_length(data, at)?;
    let (len, len_size) = read_utf8_length(data, at + skip)?;
    let start = at + skip + len_size;
    let bytes = data.get(start..start + len).ok_or(ManifestError::Truncated(start))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn read_utf16_string(data: &[u8], at: usize) -> ParseResult<String> {
    let first = read_u16(data, at)?;
    let (len, len_size) = if first & 0x8000 == 0 {
        (first as usize, 2)
    } else {
        let second = read_u16(data, at + 2)?;
        ((((first & 0x7FFF) as usize) << 16) | second as usize, 4)
    };
    let start = at + len_size;
    let mut units = Vec::with_capacity(len);
    for i in 0..len {
        units.push(read_u16(data, start + i * 2)?);
    }
    Ok(String::from_utf16_lossy(&units))
}

struct Attribute {
    name: Option<String>,
    resource_id: Option<u32>,
    value: Option<String>,
}

impl Attribute {
    fn is(&self, resource_id: u32, name: &str) -> bool {
        self.resource_id == Some(resource_id) || self.name.as_deref() == Some(name)
    }
}

fn decode_value(pool: &StringPool, raw: u32, data_type: u8, data: u32) -> Option<String> {
    match data_type {
        TYPE_STRING => pool.get(data).map(str::to_string),
        TYPE_INT_DEC | TYPE_INT_HEX => Some(data.to_string()),
        _ => pool.get(raw).map(str::to_string),
    }
}

fn read_element(
    data: &[u8],
    header: &ChunkHeader,
    pool: &StringPool,
    resource_map: &[u32],
) -> ParseResult<(Option<String>, Vec<Attribute>)> {
    let ext = header.body();
    let name = pool.get(read_u32(data, ext + 4)?).map(str::to_string);
    let attr_start = read_u16(data, ext + 8)? as usize;
    let attr_size = read_u16(data, ext + 10)? as usize;
    let attr_count = read_u16(data, ext + 12)? as usize;
    if attr_size < 20 {
        return Err(ManifestError::Malformed("attribute record too small"));
    }
    let mut attributes = Vec::with_capacity(attr_count);
    for i in 0..attr_count {
        let at = ext + attr_start + i * attr_size;
        if at + attr_size > header.end() {
            return Err(ManifestError::Truncated(at));
        }
        let name_index = read_u32(data, at + 4)?;
        let raw = read_u32(data, at + 8)?;
        let data_type = read_u8(data, at + 15)?;
        let value = read_u32(data, at + 16)?;
        attributes.push(Attribute {
            name: pool.get(name_index).map(str::to_string),
            resource_id: resource_map.get(name_index as usize).copied().filter(|id| *id != 0),
            value: decode_value(pool, raw, data_type, value),
        });
    }
    Ok((name, attributes))
}

/// Reads the package name, version and minimum SDK from a compiled manifest.
pub fn parse_manifest(data: &[u8]) -> ParseResult<ManifestInfo> {
    let root = ChunkHeader::read(data, 0).map_err(|_| ManifestError::NotBinaryXml)?;
    if root.chunk_type != RES_XML_TYPE {
        return Err(ManifestError::NotBinaryXml);
    }
    let end = root.end().min(data.len());
    let mut pool: Option<StringPool> = None;
    let mut resource_map: Vec<u32> = Vec::new();
    let mut info = ManifestInfo::default();

    let mut pos = root.body();
    while pos + 8 <= end {
        let header = ChunkHeader::read(data, pos)?;
        match header.chunk_type {
            RES_STRING_POOL_TYPE => pool = Some(StringPool::parse(data, &header)?),
            RES_XML_RESOURCE_MAP_TYPE => {
                resource_map = (header.body()..header.end().min(data.len()))
                    .step_by(4)
                    .map(|at| read_u32(data, at))
                    .collect::<ParseResult<_>>()?;
            }
            RES_XML_START_ELEMENT_TYPE => {
                let pool = pool.as_ref().ok_or(ManifestError::Malformed("element before string pool"))?;
                let (name, attributes) = read_element(data, &header, pool, &resource_map)?;
                match name.as_deref() {
                    Some("manifest") => {
                        for attr in attributes {
                            if attr.name.as_deref() == Some("package") {
                                info.package = attr.value;
                            } else if attr.is(ATTR_VERSION_CODE, "versionCode") {
                                info.version_code = attr.value;
                            } else if attr.is(ATTR_VERSION_NAME, "versionName") {
                                info.version_name = attr.value;
                            }
                        }
                    }
                    Some("uses-sdk") => {
                        if let Some(attr) = attributes.into_iter().find(|a| a.is(ATTR_MIN_SDK_VERSION, "minSdkVersion")) {
                            info.min_sdk_version = attr.value;
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        pos = header.end();
    }
    Ok(info)
}
