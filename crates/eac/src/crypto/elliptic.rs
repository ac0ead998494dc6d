//! Prime-field Weierstrass curve arithmetic for the PACE and chip
//! authentication key agreements.
//!
//! Points are handled in projective coordinates in Montgomery form using the
//! complete addition formulas of Renes/Costello/Batina 2015
//! (<https://eprint.iacr.org/2015/1060>, algorithm 1), which cover doubling
//! and the point at infinity without special cases. Only the standardized
//! domain parameters deployed on German identity documents are built in;
//! curve constants follow RFC 5639 and ICAO Doc 9303 part 11 section 9.5.1.

use std::ops::{Add, Mul, Sub};
use std::sync::LazyLock;

use crypto_bigint::BoxedUint;
use crypto_bigint::modular::{BoxedMontyForm, BoxedMontyParams};
use hex_literal::hex;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};

/// A curve point in affine coordinates
#[derive(Clone, Debug, Eq, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct AffinePoint {
    x: BoxedUint,
    y: BoxedUint,
}

impl AffinePoint {
    pub(crate) const fn new(x: BoxedUint, y: BoxedUint) -> Self {
        Self { x, y }
    }

    /// The x coordinate
    pub fn x(&self) -> &BoxedUint {
        &self.x
    }

    /// The y coordinate
    pub fn y(&self) -> &BoxedUint {
        &self.y
    }
}

/// Projective point in Montgomery form; infinity is (0 : 1 : 0)
#[derive(Clone)]
struct MontyPoint {
    x: BoxedMontyForm,
    y: BoxedMontyForm,
    z: BoxedMontyForm,
}

/// Montgomery-domain constants derived from the curve equation
#[derive(Clone, Debug)]
struct Arithmetic {
    params: BoxedMontyParams,
    a: BoxedMontyForm,
    b: BoxedMontyForm,
    b3: BoxedMontyForm,
}

/// An elliptic curve `y^2 = x^3 + ax + b` over a prime field
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct Curve {
    prime: BoxedUint,
    order: BoxedUint,
    generator: AffinePoint,
    #[zeroize(skip)]
    arith: Arithmetic,
}

struct CurveData {
    prime: &'static [u8],
    a: &'static [u8],
    b: &'static [u8],
    gx: &'static [u8],
    gy: &'static [u8],
    order: &'static [u8],
}

impl Curve {
    fn from_data(data: &CurveData) -> Self {
        let prime = static_uint(data.prime);
        let a = static_uint(data.a);
        let b = static_uint(data.b);
        let params =
            BoxedMontyParams::new(prime.to_odd().expect("static curve prime is odd"));

        let a_monty = BoxedMontyForm::new(a, params.clone());
        let b_monty = BoxedMontyForm::new(b, params.clone());
        let b3 = (&b_monty).add(&b_monty).add(&b_monty);
        let curve = Self {
            prime,
            order: static_uint(data.order),
            generator: AffinePoint::new(static_uint(data.gx), static_uint(data.gy)),
            arith: Arithmetic {
                params,
                a: a_monty,
                b: b_monty,
                b3,
            },
        };
        debug_assert!(curve.is_on_curve(&curve.generator));
        curve
    }

    /// Byte length of a field element
    pub fn field_len(&self) -> usize {
        (self.prime.bits() as usize).div_ceil(8)
    }

    /// The group order
    pub fn order(&self) -> &BoxedUint {
        &self.order
    }

    /// The (possibly mapped) generator point
    pub fn generator(&self) -> &AffinePoint {
        &self.generator
    }

    fn monty(&self, value: &BoxedUint) -> BoxedMontyForm {
        BoxedMontyForm::new(value.clone(), self.arith.params.clone())
    }

    fn infinity(&self) -> MontyPoint {
        MontyPoint {
            x: BoxedMontyForm::zero(self.arith.params.clone()),
            y: BoxedMontyForm::one(self.arith.params.clone()),
            z: BoxedMontyForm::zero(self.arith.params.clone()),
        }
    }

    fn to_monty(&self, point: &AffinePoint) -> MontyPoint {
        MontyPoint {
            x: self.monty(&point.x),
            y: self.monty(&point.y),
            z: BoxedMontyForm::one(self.arith.params.clone()),
        }
    }

    fn to_affine(&self, point: &MontyPoint) -> Result<AffinePoint> {
        let z_inverse = point
            .z
            .invert()
            .into_option()
            .ok_or(Error::Crypto("operation produced the point at infinity"))?;
        Ok(AffinePoint::new(
            (&point.x).mul(&z_inverse).retrieve(),
            (&point.y).mul(&z_inverse).retrieve(),
        ))
    }

    /// Complete projective addition; also valid for doubling and infinity
    fn add_points(&self, p: &MontyPoint, q: &MontyPoint) -> MontyPoint {
        let a = &self.arith.a;
        let b3 = &self.arith.b3;

        let xx = (&p.x).mul(&q.x);
        let yy = (&p.y).mul(&q.y);
        let zz = (&p.z).mul(&q.z);
        // Cross terms X1·Y2 + X2·Y1 and friends via the product of sums.
        let xy = (&(&p.x).add(&p.y)).mul(&(&q.x).add(&q.y)).sub(&xx).sub(&yy);
        let xz = (&(&p.x).add(&p.z)).mul(&(&q.x).add(&q.z)).sub(&xx).sub(&zz);
        let yz = (&(&p.y).add(&p.z)).mul(&(&q.y).add(&q.z)).sub(&yy).sub(&zz);

        let m = (&a.mul(&xz)).add(&b3.mul(&zz));
        let n = (&b3.mul(&xz)).add(&a.mul(&(&xx).sub(&a.mul(&zz))));
        let t = (&(&xx).add(&xx).add(&xx)).add(&a.mul(&zz));
        let yy_minus_m = (&yy).sub(&m);
        let yy_plus_m = (&yy).add(&m);

        MontyPoint {
            x: (&(&xy).mul(&yy_minus_m)).sub(&(&yz).mul(&n)),
            y: (&yy_minus_m.mul(&yy_plus_m)).add(&(&t).mul(&n)),
            z: (&yz.mul(&yy_plus_m)).add(&xy.mul(&t)),
        }
    }

    fn mul_point(&self, scalar: &BoxedUint, point: &MontyPoint) -> MontyPoint {
        let mut acc = self.infinity();
        let mut addend = point.clone();
        for i in 0..scalar.bits() {
            let sum = self.add_points(&acc, &addend);
            if bool::from(scalar.bit(i)) {
                acc = sum;
            }
            addend = self.add_points(&addend, &addend);
        }
        acc
    }

    /// Whether an affine point satisfies the curve equation
    pub fn is_on_curve(&self, point: &AffinePoint) -> bool {
        if point.x >= self.prime || point.y >= self.prime {
            return false;
        }
        let x = self.monty(&point.x);
        let y = self.monty(&point.y);
        let rhs = (&(&x.square()).mul(&x))
            .add(&x.mul(&self.arith.a))
            .add(&self.arith.b);
        y.square() == rhs
    }

    /// Scalar multiplication, rejecting off-curve peers and degenerate
    /// results
    pub fn multiply(&self, scalar: &BoxedUint, point: &AffinePoint) -> Result<AffinePoint> {
        if !self.is_on_curve(point) {
            return Err(Error::Crypto("peer point is not on the curve"));
        }
        let product = self.mul_point(scalar, &self.to_monty(point));
        self.to_affine(&product)
    }

    /// Public key for a private scalar
    pub fn public_key(&self, scalar: &BoxedUint) -> Result<AffinePoint> {
        self.multiply(scalar, &self.generator)
    }

    /// Replace the generator by `s·G + shared` (generic mapping)
    pub fn map_generator(&self, s: &BoxedUint, shared: &AffinePoint) -> Result<Self> {
        if !self.is_on_curve(shared) {
            return Err(Error::Crypto("peer point is not on the curve"));
        }
        let s_g = self.mul_point(s, &self.to_monty(&self.generator));
        let mapped = self.to_affine(&self.add_points(&s_g, &self.to_monty(shared)))?;
        if !self.is_on_curve(&mapped) {
            return Err(Error::Crypto("mapped generator is not on the curve"));
        }
        Ok(Self {
            prime: self.prime.clone(),
            order: self.order.clone(),
            generator: mapped,
            arith: self.arith.clone(),
        })
    }

    /// Uniform random scalar in `[1, order)`
    pub fn generate_scalar<R: RngCore + ?Sized>(&self, rng: &mut R) -> Result<Zeroizing<BoxedUint>> {
        let mut buf = Zeroizing::new(vec![0u8; self.field_len()]);
        loop {
            rng.fill_bytes(&mut buf);
            let candidate = BoxedUint::from_be_slice(&buf, self.prime.bits_precision())
                .map_err(|_| Error::Crypto("scalar decoding failed"))?;
            if !bool::from(candidate.is_zero()) && candidate < self.order {
                return Ok(Zeroizing::new(candidate));
            }
        }
    }

    /// Fresh key pair on this curve
    pub fn generate_keypair<R: RngCore + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<(Zeroizing<BoxedUint>, AffinePoint)> {
        let private = self.generate_scalar(rng)?;
        let public = self.public_key(&private)?;
        Ok((private, public))
    }

    /// Parse an uncompressed point (`04 || x || y`), verifying it lies on
    /// the curve
    pub fn decode_point(&self, bytes: &[u8]) -> Result<AffinePoint> {
        let coordinate_len = self.field_len();
        let coordinates = match bytes.split_first() {
            Some((0x04, rest)) if rest.len() == 2 * coordinate_len => rest,
            _ => return Err(Error::MalformedEncoding("expected an uncompressed point")),
        };
        let precision = self.prime.bits_precision();
        let x = BoxedUint::from_be_slice(&coordinates[..coordinate_len], precision)
            .map_err(|_| Error::MalformedEncoding("point coordinate"))?;
        let y = BoxedUint::from_be_slice(&coordinates[coordinate_len..], precision)
            .map_err(|_| Error::MalformedEncoding("point coordinate"))?;
        let point = AffinePoint::new(x, y);
        if !self.is_on_curve(&point) {
            return Err(Error::Crypto("peer point is not on the curve"));
        }
        Ok(point)
    }

    /// Encode a point uncompressed (`04 || x || y`)
    pub fn encode_point(&self, point: &AffinePoint) -> Vec<u8> {
        let len = self.field_len();
        let mut out = Vec::with_capacity(1 + 2 * len);
        out.push(0x04);
        out.extend_from_slice(&be_padded(&point.x, len));
        out.extend_from_slice(&be_padded(&point.y, len));
        out
    }

    /// The x coordinate as a fixed-width big-endian value; this is both the
    /// shared secret of a key agreement and the compressed point form
    pub fn x_bytes(&self, point: &AffinePoint) -> Zeroizing<Vec<u8>> {
        be_padded(&point.x, self.field_len())
    }
}

fn be_padded(value: &BoxedUint, len: usize) -> Zeroizing<Vec<u8>> {
    let bytes = Zeroizing::new(value.to_be_bytes());
    let mut out = Zeroizing::new(vec![0u8; len]);
    if bytes.len() >= len {
        out.copy_from_slice(&bytes[bytes.len() - len..]);
    } else {
        out[len - bytes.len()..].copy_from_slice(&bytes);
    }
    out
}

fn static_uint(bytes: &'static [u8]) -> BoxedUint {
    BoxedUint::from_be_slice(bytes, (bytes.len() * 8) as u32)
        .expect("static curve parameters are valid")
}

static NIST_P256: LazyLock<Curve> = LazyLock::new(|| {
    Curve::from_data(&CurveData {
        prime: &hex!("ffffffff00000001000000000000000000000000ffffffffffffffffffffffff"),
        a: &hex!("ffffffff00000001000000000000000000000000fffffffffffffffffffffffc"),
        b: &hex!("5ac635d8aa3a93e7b3ebbd55769886bc651d06b0cc53b0f63bce3c3e27d2604b"),
        gx: &hex!("6b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c296"),
        gy: &hex!("4fe342e2fe1a7f9b8ee7eb4a7c0f9e162bce33576b315ececbb6406837bf51f5"),
        order: &hex!("ffffffff00000000ffffffffffffffffbce6faada7179e84f3b9cac2fc632551"),
    })
});

static BRAINPOOL_P256R1: LazyLock<Curve> = LazyLock::new(|| {
    Curve::from_data(&CurveData {
        prime: &hex!("a9fb57dba1eea9bc3e660a909d838d726e3bf623d52620282013481d1f6e5377"),
        a: &hex!("7d5a0975fc2c3057eef67530417affe7fb8055c126dc5c6ce94a4b44f330b5d9"),
        b: &hex!("26dc5c6ce94a4b44f330b5d9bbd77cbf958416295cf7e1ce6bccdc18ff8c07b6"),
        gx: &hex!("8bd2aeb9cb7e57cb2c4b482ffc81b7afb9de27e1e3bd23c23a4453bd9ace3262"),
        gy: &hex!("547ef835c3dac4fd97f8461a14611dc9c27745132ded8e545c1d54c72f046997"),
        order: &hex!("a9fb57dba1eea9bc3e660a909d838d718c397aa3b561a6f7901e0e82974856a7"),
    })
});

static BRAINPOOL_P384R1: LazyLock<Curve> = LazyLock::new(|| {
    Curve::from_data(&CurveData {
        prime: &hex!(
            "8cb91e82a3386d280f5d6f7e50e641df152f7109ed5456b412b1da197fb71123"
            "acd3a729901d1a71874700133107ec53"
        ),
        a: &hex!(
            "7bc382c63d8c150c3c72080ace05afa0c2bea28e4fb22787139165efba91f90f"
            "8aa5814a503ad4eb04a8c7dd22ce2826"
        ),
        b: &hex!(
            "04a8c7dd22ce28268b39b55416f0447c2fb77de107dcd2a62e880ea53eeb62d5"
            "7cb4390295dbc9943ab78696fa504c11"
        ),
        gx: &hex!(
            "1d1c64f068cf45ffa2a63a81b7c13f6b8847a3e77ef14fe3db7fcafe0cbd10e8"
            "e826e03436d646aaef87b2e247d4af1e"
        ),
        gy: &hex!(
            "8abe1d7520f9c2a45cb1eb8e95cfd55262b70b29feec5864e19c054ff9912928"
            "0e4646217791811142820341263c5315"
        ),
        order: &hex!(
            "8cb91e82a3386d280f5d6f7e50e641df152f7109ed5456b31f166e6cac0425a7"
            "cf3ab6af6b7fc3103b883202e9046565"
        ),
    })
});

static BRAINPOOL_P512R1: LazyLock<Curve> = LazyLock::new(|| {
    Curve::from_data(&CurveData {
        prime: &hex!(
            "aadd9db8dbe9c48b3fd4e6ae33c9fc07cb308db3b3c9d20ed6639cca70330871"
            "7d4d9b009bc66842aecda12ae6a380e62881ff2f2d82c68528aa6056583a48f3"
        ),
        a: &hex!(
            "7830a3318b603b89e2327145ac234cc594cbdd8d3df91610a83441caea9863bc"
            "2ded5d5aa8253aa10a2ef1c98b9ac8b57f1117a72bf2c7b9e7c1ac4d77fc94ca"
        ),
        b: &hex!(
            "3df91610a83441caea9863bc2ded5d5aa8253aa10a2ef1c98b9ac8b57f1117a7"
            "2bf2c7b9e7c1ac4d77fc94cadc083e67984050b75ebae5dd2809bd638016f723"
        ),
        gx: &hex!(
            "81aee4bdd82ed9645a21322e9c4c6a9385ed9f70b5d916c1b43b62eef4d0098e"
            "ff3b1f78e2d0d48d50d1687b93b97d5f7c6d5047406a5e688b352209bcb9f822"
        ),
        gy: &hex!(
            "7dde385d566332ecc0eabfa9cf7822fdf209f70024a57b1aa000c55b881f8111"
            "b2dcde494a5f485e5bca4bd88a2763aed1ca2b2fa8f0540678cd1e0f3ad80892"
        ),
        order: &hex!(
            "aadd9db8dbe9c48b3fd4e6ae33c9fc07cb308db3b3c9d20ed6639cca70330870"
            "553e5c414ca92619418661197fac10471db1d381085ddaddb58796829ca90069"
        ),
    })
});

/// Resolve a TR-03110 standardized domain parameter index
pub fn standardized_curve(id: i32) -> Result<&'static Curve> {
    match id {
        12 => Ok(&NIST_P256),
        13 => Ok(&BRAINPOOL_P256R1),
        16 => Ok(&BRAINPOOL_P384R1),
        17 => Ok(&BRAINPOOL_P512R1),
        other => Err(Error::UnsupportedDomainParameters(other)),
    }
}
