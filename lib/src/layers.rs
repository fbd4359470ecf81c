//! Layer layouts of the frozen feature extractor.
//!
//! A layout is a list of textual layer descriptors, one per layer, in the
//! order the layers are evaluated:
//!
//! * `conv:IN:OUT[:KERNEL[:PADDING]]` - a 2d convolution, kernel defaults to 3
//!   and padding to `KERNEL / 2`
//! * `relu` - a rectified linear activation
//! * `pool[:KERNEL[:STRIDE]]` - a max pooling, both default to 2
//! * `bn:CHANNELS` - an inference-mode batch normalization
//!
//! Anything else is rejected while parsing, so an extractor can never contain
//! a layer the model assembler doesn't know how to name.

use crate::Error;

const BATCH_NORM_EPSILON: f32 = 1e-5;

/// The four kinds of layer a feature extractor can be made of.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Conv,
    Relu,
    Pool,
    BatchNorm,
}

impl LayerKind {
    /// The prefix used when naming a layer of this kind, eg. `conv_3`
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Conv => "conv",
            Self::Relu => "relu",
            Self::Pool => "pool",
            Self::BatchNorm => "bn",
        }
    }
}

/// The kind and hyper parameters of a single layer
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LayerSpec {
    Conv {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
    },
    Relu,
    MaxPool {
        kernel: usize,
        stride: usize,
    },
    BatchNorm {
        channels: usize,
        epsilon: f32,
    },
}

impl LayerSpec {
    pub fn conv(in_channels: usize, out_channels: usize) -> Self {
        Self::Conv {
            in_channels,
            out_channels,
            kernel: 3,
            padding: 1,
        }
    }

    pub fn max_pool() -> Self {
        Self::MaxPool {
            kernel: 2,
            stride: 2,
        }
    }

    pub fn batch_norm(channels: usize) -> Self {
        Self::BatchNorm {
            channels,
            epsilon: BATCH_NORM_EPSILON,
        }
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Conv { .. } => LayerKind::Conv,
            Self::Relu => LayerKind::Relu,
            Self::MaxPool { .. } => LayerKind::Pool,
            Self::BatchNorm { .. } => LayerKind::BatchNorm,
        }
    }

    /// Parses a single layer descriptor, `index` is only used for error
    /// reporting
    pub fn parse(index: usize, descriptor: &str) -> Result<Self, Error> {
        let mut parts = descriptor.trim().split(':');
        let kind = parts.next().unwrap_or("").trim().to_ascii_lowercase();

        let args = parts
            .map(|p| p.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| Error::MalformedLayer {
                index,
                descriptor: descriptor.to_owned(),
            })?;

        let malformed = || Error::MalformedLayer {
            index,
            descriptor: descriptor.to_owned(),
        };

        let spec = match kind.as_str() {
            "conv" => match *args.as_slice() {
                [i, o] => Self::conv(i, o),
                [i, o, k] => Self::Conv {
                    in_channels: i,
                    out_channels: o,
                    kernel: k,
                    padding: k / 2,
                },
                [i, o, k, p] => Self::Conv {
                    in_channels: i,
                    out_channels: o,
                    kernel: k,
                    padding: p,
                },
                _ => return Err(malformed()),
            },
            "relu" if args.is_empty() => Self::Relu,
            "pool" => match *args.as_slice() {
                [] => Self::max_pool(),
                [k] => Self::MaxPool {
                    kernel: k,
                    stride: k,
                },
                [k, s] => Self::MaxPool {
                    kernel: k,
                    stride: s,
                },
                _ => return Err(malformed()),
            },
            "bn" => match *args.as_slice() {
                [c] => Self::batch_norm(c),
                _ => return Err(malformed()),
            },
            "relu" => return Err(malformed()),
            _ => {
                return Err(Error::UnrecognizedLayer {
                    index,
                    kind: kind.clone(),
                })
            }
        };

        match spec {
            Self::Conv {
                in_channels,
                out_channels,
                kernel,
                ..
            } if in_channels == 0 || out_channels == 0 || kernel == 0 => Err(malformed()),
            Self::MaxPool { kernel, stride } if kernel == 0 || stride == 0 => Err(malformed()),
            Self::BatchNorm { channels, .. } if channels == 0 => Err(malformed()),
            spec => Ok(spec),
        }
    }

    /// The tensors this layer is parameterized by, as `(suffix, shape)` pairs
    /// using the same suffixes as torchvision state dicts
    pub(crate) fn weight_shapes(&self) -> Vec<(&'static str, Vec<usize>)> {
        match *self {
            Self::Conv {
                in_channels,
                out_channels,
                kernel,
                ..
            } => vec![
                ("weight", vec![out_channels, in_channels, kernel, kernel]),
                ("bias", vec![out_channels]),
            ],
            Self::BatchNorm { channels, .. } => vec![
                ("weight", vec![channels]),
                ("bias", vec![channels]),
                ("running_mean", vec![channels]),
                ("running_var", vec![channels]),
            ],
            Self::Relu | Self::MaxPool { .. } => Vec::new(),
        }
    }
}

/// Parses a full layout, failing on the first descriptor that isn't one of
/// the four recognized layer kinds
pub fn parse_layout<I, S>(descriptors: I) -> Result<Vec<LayerSpec>, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let layout = descriptors
        .into_iter()
        .enumerate()
        .map(|(i, d)| LayerSpec::parse(i, d.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    check_channels(&layout)?;
    Ok(layout)
}

// Each convolution and batch norm must consume the channel count produced by
// the layers before it, the first convolution consumes the 3 RGB channels
fn check_channels(layout: &[LayerSpec]) -> Result<(), Error> {
    let mut channels = 3;

    for (index, spec) in layout.iter().enumerate() {
        match *spec {
            LayerSpec::Conv {
                in_channels,
                out_channels,
                ..
            } => {
                if in_channels != channels {
                    return Err(Error::MalformedLayer {
                        index,
                        descriptor: format!(
                            "conv expects {} input channels, but receives {}",
                            in_channels, channels
                        ),
                    });
                }
                channels = out_channels;
            }
            LayerSpec::BatchNorm {
                channels: bn_channels,
                ..
            } if bn_channels != channels => {
                return Err(Error::MalformedLayer {
                    index,
                    descriptor: format!(
                        "bn expects {} channels, but receives {}",
                        bn_channels, channels
                    ),
                });
            }
            _ => {}
        }
    }

    Ok(())
}

/// The `features` part of VGG-19, in torchvision order, so that layer `i`
/// corresponds to the `features.{i}.*` tensors of a torchvision state dict
pub fn vgg19_layout() -> Vec<LayerSpec> {
    // `None` marks a max pooling
    const CFG: &[Option<usize>] = &[
        Some(64),
        Some(64),
        None,
        Some(128),
        Some(128),
        None,
        Some(256),
        Some(256),
        Some(256),
        Some(256),
        None,
        Some(512),
        Some(512),
        Some(512),
        Some(512),
        None,
        Some(512),
        Some(512),
        Some(512),
        Some(512),
        None,
    ];

    let mut layout = Vec::with_capacity(37);
    let mut channels = 3;

    for entry in CFG {
        match entry {
            Some(out) => {
                layout.push(LayerSpec::conv(channels, *out));
                layout.push(LayerSpec::Relu);
                channels = *out;
            }
            None => layout.push(LayerSpec::max_pool()),
        }
    }

    layout
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_all_kinds() {
        let layout = parse_layout(&["conv:3:8", "bn:8", "relu", "pool", "conv:8:4:5", "pool:3:1"])
            .unwrap();

        assert_eq!(layout[0], LayerSpec::conv(3, 8));
        assert_eq!(layout[1], LayerSpec::batch_norm(8));
        assert_eq!(layout[2], LayerSpec::Relu);
        assert_eq!(layout[3], LayerSpec::max_pool());
        assert_eq!(
            layout[4],
            LayerSpec::Conv {
                in_channels: 8,
                out_channels: 4,
                kernel: 5,
                padding: 2,
            }
        );
        assert_eq!(
            layout[5],
            LayerSpec::MaxPool {
                kernel: 3,
                stride: 1
            }
        );
    }

    #[test]
    fn rejects_unrecognized_kinds() {
        match parse_layout(&["conv:3:8", "relu", "dropout", "conv:8:8"]) {
            Err(Error::UnrecognizedLayer { index, kind }) => {
                assert_eq!(index, 2);
                assert_eq!(kind, "dropout");
            }
            other => panic!("expected an unrecognized layer error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            parse_layout(&["conv:3"]),
            Err(Error::MalformedLayer { index: 0, .. })
        ));
        assert!(matches!(
            parse_layout(&["relu:2"]),
            Err(Error::MalformedLayer { index: 0, .. })
        ));
        assert!(matches!(
            parse_layout(&["conv:3:x"]),
            Err(Error::MalformedLayer { index: 0, .. })
        ));
        // channel counts have to chain
        assert!(matches!(
            parse_layout(&["conv:3:8", "conv:4:8"]),
            Err(Error::MalformedLayer { index: 1, .. })
        ));
    }

    #[test]
    fn vgg19_matches_torchvision_indices() {
        let layout = vgg19_layout();
        assert_eq!(layout.len(), 37);

        let convs = layout
            .iter()
            .filter(|l| l.kind() == LayerKind::Conv)
            .count();
        assert_eq!(convs, 16);

        // features.28 is the first conv of the last block, features.36 the last pool
        assert_eq!(layout[28], LayerSpec::conv(512, 512));
        assert_eq!(layout[36], LayerSpec::max_pool());
        assert!(check_channels(&layout).is_ok());
    }
}
