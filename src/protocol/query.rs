//! JPIP request fields and query serialisation

use std::fmt;

use crate::config::Endpoint;
use crate::types::ImageParameter;

/// Request fields this client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestField {
    Target,
    ChannelNew,
    ChannelId,
    Type,
    Context,
    Layers,
    FrameSize,
    Offset,
    RegionSize,
    MaxBandwidth,
    SamplingRate,
    DeliveryRate,
    Model,
    Length,
}

impl RequestField {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestField::Target => "target",
            RequestField::ChannelNew => "cnew",
            RequestField::ChannelId => "cid",
            RequestField::Type => "type",
            RequestField::Context => "context",
            RequestField::Layers => "layers",
            RequestField::FrameSize => "fsiz",
            RequestField::Offset => "roff",
            RequestField::RegionSize => "rsiz",
            RequestField::MaxBandwidth => "mbw",
            RequestField::SamplingRate => "srate",
            RequestField::DeliveryRate => "drate",
            RequestField::Model => "model",
            RequestField::Length => "len",
        }
    }
}

impl fmt::Display for RequestField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of `field=value` pairs.
///
/// Setting a field that is already present replaces its value in place, so the
/// serialised order is the order of first insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JpipQuery {
    fields: Vec<(RequestField, String)>,
}

impl JpipQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: RequestField, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.fields.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = value,
            None => self.fields.push((field, value)),
        }
        self
    }

    pub fn with(mut self, field: RequestField, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn get(&self, field: RequestField) -> Option<&str> {
        self.fields.iter().find(|(f, _)| *f == field).map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, field: RequestField) -> bool {
        self.get(field).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Window request for `param` over composition layers `first` to `last`.
    ///
    /// `last` may be smaller than `first`; the server then wraps around the end
    /// of the layer range, which is how a movie is streamed from its current frame.
    pub fn window(param: &ImageParameter, first: u32, last: u32) -> Self {
        let res = &param.resolution;
        let region = &param.region;
        JpipQuery::new()
            .with(RequestField::Context, format!("jpxl<{}-{}>", first, last))
            .with(RequestField::Layers, param.quality_layers.to_string())
            .with(RequestField::FrameSize, format!("{},{},closest", res.width, res.height))
            .with(RequestField::Offset, format!("{},{}", region.x, region.y))
            .with(RequestField::RegionSize, format!("{},{}", region.width, region.height))
    }

    /// Add the rate negotiation fields (`mbw`, `srate`, `drate=1`).
    ///
    /// The bandwidth is sent in whole bits per second.
    pub fn with_rate(self, bandwidth_bps: f64, speed: u32) -> Self {
        self.with(RequestField::MaxBandwidth, format!("{}", bandwidth_bps.max(0.0) as u64))
            .with(RequestField::SamplingRate, speed.to_string())
            .with(RequestField::DeliveryRate, "1")
    }

    /// Rate-only update for an already open window request.
    pub fn rate_update(bandwidth_bps: f64, speed: u32) -> Self {
        JpipQuery::new().with_rate(bandwidth_bps, speed)
    }
}

impl fmt::Display for JpipQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{}={}", field, value)?;
        }
        Ok(())
    }
}

/// One HTTP GET carrying a JPIP query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpipRequest {
    /// `host:port` of the server
    pub authority: String,
    pub path: String,
    pub query: JpipQuery,
}

impl JpipRequest {
    pub fn get(endpoint: &Endpoint, query: JpipQuery) -> Self {
        Self { authority: endpoint.authority(), path: endpoint.path.clone(), query }
    }

    /// Absolute `http` URL of the request.
    pub fn url(&self) -> String {
        let mut url = format!("http://{}{}", self.authority, self.path);
        if !self.query.is_empty() {
            url.push('?');
            url.push_str(&self.query.to_string());
        }
        url
    }
}
