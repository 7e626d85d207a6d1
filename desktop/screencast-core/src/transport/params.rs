//! SPA param pods announced to the consumer.

use super::{BufferOffer, FormatOffer};
use crate::error::TransportError;
use crate::format::PixelFormat;
use crate::meta::{HEADER_META_SIZE, REGION_SIZE, cursor_meta_size};
use libspa::param::ParamType;
use libspa::param::format::{FormatProperties, MediaSubtype, MediaType};
use libspa::param::video::VideoFormat;
use libspa::pod::serialize::PodSerializer;
use libspa::pod::{ChoiceValue, Object, Pod, Property, PropertyFlags, Value};
use libspa::sys::{
    SPA_DATA_DmaBuf, SPA_DATA_MemFd, SPA_META_Cursor, SPA_META_Header, SPA_META_VideoDamage,
    SPA_PARAM_BUFFERS_align, SPA_PARAM_BUFFERS_blocks, SPA_PARAM_BUFFERS_buffers,
    SPA_PARAM_BUFFERS_dataType, SPA_PARAM_BUFFERS_size, SPA_PARAM_BUFFERS_stride,
    SPA_PARAM_META_size, SPA_PARAM_META_type,
};
use libspa::utils::{Choice, ChoiceEnum, ChoiceFlags, Fraction, Id, Rectangle, SpaTypes};
use std::io::Cursor;

/// Largest cursor bitmap a consumer may ask room for.
const MAX_CURSOR_EDGE: u32 = 1024;

pub fn video_format(format: PixelFormat) -> VideoFormat {
    match format {
        PixelFormat::Bgra => VideoFormat::BGRA,
        PixelFormat::Bgrx => VideoFormat::BGRx,
        PixelFormat::Bgr => VideoFormat::BGR,
    }
}

pub fn pixel_format(format: VideoFormat) -> Option<PixelFormat> {
    [PixelFormat::Bgra, PixelFormat::Bgrx, PixelFormat::Bgr]
        .into_iter()
        .find(|f| video_format(*f) == format)
}

fn property(key: u32, value: Value) -> Property {
    Property {
        key,
        flags: PropertyFlags::empty(),
        value,
    }
}

fn int_range(default: i32, min: i32, max: i32) -> Value {
    Value::Choice(ChoiceValue::Int(Choice(
        ChoiceFlags::empty(),
        ChoiceEnum::Range { default, min, max },
    )))
}

pub fn format_object(offer: &FormatOffer) -> Object {
    let mut properties = vec![
        property(
            FormatProperties::MediaType.as_raw(),
            Value::Id(Id(MediaType::Video.as_raw())),
        ),
        property(
            FormatProperties::MediaSubtype.as_raw(),
            Value::Id(Id(MediaSubtype::Raw.as_raw())),
        ),
    ];

    let formats = offer
        .formats
        .iter()
        .map(|f| Id(video_format(*f).as_raw()))
        .collect::<Vec<_>>();
    let format_value = match formats.as_slice() {
        [single] => Value::Id(*single),
        _ => Value::Choice(ChoiceValue::Id(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Enum {
                default: formats.first().copied().unwrap_or(Id(0)),
                alternatives: formats.clone(),
            },
        ))),
    };
    properties.push(property(FormatProperties::VideoFormat.as_raw(), format_value));

    if !offer.modifiers.is_empty() {
        let modifiers = offer
            .modifiers
            .iter()
            .map(|m| u64::from(*m) as i64)
            .collect::<Vec<_>>();
        let mut flags = PropertyFlags::MANDATORY;
        if !offer.fixate {
            flags |= PropertyFlags::DONT_FIXATE;
        }
        properties.push(Property {
            key: FormatProperties::VideoModifier.as_raw(),
            flags,
            value: Value::Choice(ChoiceValue::Long(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Enum {
                    default: modifiers[0],
                    alternatives: modifiers,
                },
            ))),
        });
    }

    properties.push(property(
        FormatProperties::VideoSize.as_raw(),
        Value::Rectangle(Rectangle {
            width: offer.size.w.max(1) as u32,
            height: offer.size.h.max(1) as u32,
        }),
    ));
    properties.push(property(
        FormatProperties::VideoFramerate.as_raw(),
        Value::Fraction(Fraction { num: 0, denom: 1 }),
    ));
    properties.push(property(
        FormatProperties::VideoMaxFramerate.as_raw(),
        Value::Choice(ChoiceValue::Fraction(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: Fraction {
                    num: offer.max_framerate,
                    denom: 1,
                },
                min: Fraction {
                    num: offer.min_framerate,
                    denom: 1,
                },
                max: Fraction {
                    num: offer.max_framerate,
                    denom: 1,
                },
            },
        ))),
    ));

    Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties,
    }
}

pub fn buffers_object(offer: &BufferOffer) -> Object {
    let mut mask = 0i32;
    if offer.data_types.dmabuf {
        mask |= 1 << SPA_DATA_DmaBuf;
    }
    if offer.data_types.memfd {
        mask |= 1 << SPA_DATA_MemFd;
    }

    let mut properties = vec![
        property(
            SPA_PARAM_BUFFERS_buffers,
            int_range(
                offer.buffers.default as i32,
                offer.buffers.min as i32,
                offer.buffers.max as i32,
            ),
        ),
        property(SPA_PARAM_BUFFERS_blocks, Value::Int(offer.blocks as i32)),
    ];
    if offer.data_types.memfd {
        properties.push(property(SPA_PARAM_BUFFERS_size, Value::Int(offer.size as i32)));
        properties.push(property(SPA_PARAM_BUFFERS_stride, Value::Int(offer.stride as i32)));
    }
    properties.push(property(SPA_PARAM_BUFFERS_align, Value::Int(offer.align as i32)));
    properties.push(property(
        SPA_PARAM_BUFFERS_dataType,
        Value::Choice(ChoiceValue::Int(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Flags {
                default: mask,
                flags: vec![mask],
            },
        ))),
    ));

    Object {
        type_: SpaTypes::ObjectParamBuffers.as_raw(),
        id: ParamType::Buffers.as_raw(),
        properties,
    }
}

fn meta_object(meta_type: u32, size: Value) -> Object {
    Object {
        type_: SpaTypes::ObjectParamMeta.as_raw(),
        id: ParamType::Meta.as_raw(),
        properties: vec![
            property(SPA_PARAM_META_type, Value::Id(Id(meta_type))),
            property(SPA_PARAM_META_size, size),
        ],
    }
}

/// Buffers param followed by the header, cursor and damage metas.
pub fn buffer_objects(offer: &BufferOffer) -> Vec<Object> {
    let cursor_default = offer.cursor_meta_size as i32;
    vec![
        buffers_object(offer),
        meta_object(SPA_META_Header, Value::Int(HEADER_META_SIZE as i32)),
        meta_object(
            SPA_META_Cursor,
            int_range(
                cursor_default,
                cursor_meta_size(1, 1) as i32,
                cursor_meta_size(MAX_CURSOR_EDGE, MAX_CURSOR_EDGE) as i32,
            ),
        ),
        meta_object(
            SPA_META_VideoDamage,
            int_range(
                (REGION_SIZE as u32 * offer.damage_regions) as i32,
                REGION_SIZE as i32,
                (REGION_SIZE as u32 * offer.damage_regions) as i32,
            ),
        ),
    ]
}

pub fn serialize(object: Object) -> Result<Vec<u8>, TransportError> {
    PodSerializer::serialize(Cursor::new(Vec::new()), &Value::Object(object))
        .map(|(cursor, _)| cursor.into_inner())
        .map_err(|err| TransportError::Pod(format!("{err:?}")))
}

pub fn serialize_all(objects: Vec<Object>) -> Result<Vec<Vec<u8>>, TransportError> {
    objects.into_iter().map(serialize).collect()
}

/// Borrows serialized pods for `connect`/`update_params`.
pub fn as_pods(buffers: &[Vec<u8>]) -> Result<Vec<&Pod>, TransportError> {
    buffers
        .iter()
        .map(|bytes| Pod::from_bytes(bytes).ok_or_else(|| TransportError::Pod("invalid pod".into())))
        .collect()
}
