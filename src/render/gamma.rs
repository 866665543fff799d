//! sRGB transfer functions applied on the CPU after readback.

/// Piecewise sRGB encoding of one linear channel.
pub fn linear_to_srgb(linear: f32) -> f32 {
    let linear = linear.clamp(0.0, 1.0);
    if linear < 0.0031308 {
        12.92 * linear
    } else {
        1.055 * linear.powf(1.0 / 2.4) - 0.055
    }
}

/// Inverse of [`linear_to_srgb`].
pub fn srgb_to_linear(srgb: f32) -> f32 {
    let srgb = srgb.clamp(0.0, 1.0);
    if srgb < 0.04045 {
        srgb / 12.92
    } else {
        ((srgb + 0.055) / 1.055).powf(2.4)
    }
}

/// Encode the RGB channels of an RGBA float image in place.
pub fn encode_image(rgba: &mut [f32]) {
    for px in rgba.chunks_exact_mut(4) {
        for c in &mut px[..3] {
            *c = linear_to_srgb(*c);
        }
    }
}
