use anyhow::Context;

/// Bitmap over piece indices, wire bit order: bit 7 of byte 0 is piece 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl BitField {
    pub fn empty(num_pieces: usize) -> Self {
        Self {
            bits: vec![0; std::cmp::max(num_pieces.div_ceil(8), 1)],
            num_pieces,
        }
    }

    pub fn full(num_pieces: usize) -> Self {
        let mut this = Self::empty(num_pieces);
        for piece in 0..num_pieces {
            this.add(piece).expect("piece fits the fresh bitfield");
        }
        this
    }

    /// Build from raw wire bytes. Fails if the byte count does not match the
    /// piece count or a spare trailing bit is set.
    pub fn from_bytes(data: &[u8], num_pieces: usize) -> anyhow::Result<Self> {
        let capacity = data.len() * 8;
        let leftover = capacity
            .checked_sub(num_pieces)
            .context("bitfield has less capacity than needed")?;
        if leftover >= 8 {
            anyhow::bail!("bitfield is larger than needed");
        }
        let this = Self {
            bits: data.to_vec(),
            num_pieces,
        };
        for piece in num_pieces..capacity {
            anyhow::ensure!(!this.is_set(piece), "spare bit {piece} is set");
        }
        Ok(this)
    }

    fn is_set(&self, piece: usize) -> bool {
        let Some(block) = self.bits.get(piece / 8) else {
            return false;
        };
        let position = (piece % 8) as u32;
        block & 1u8.rotate_right(position + 1) != 0
    }

    pub fn has(&self, piece: usize) -> bool {
        piece < self.num_pieces && self.is_set(piece)
    }

    pub fn add(&mut self, piece: usize) -> anyhow::Result<()> {
        if piece >= self.num_pieces {
            return Err(anyhow::anyhow!("piece {piece} does not exist"));
        }
        let block = &mut self.bits[piece / 8];
        let position = (piece % 8) as u32;
        *block |= 1u8.rotate_right(position + 1);
        Ok(())
    }

    pub fn remove(&mut self, piece: usize) -> anyhow::Result<()> {
        if piece >= self.num_pieces {
            return Err(anyhow::anyhow!("piece {piece} does not exist"));
        }
        let block = &mut self.bits[piece / 8];
        let position = (piece % 8) as u32;
        *block &= !1u8.rotate_right(position + 1);
        Ok(())
    }

    /// Iterator over completed piece indices.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        let num_pieces = self.num_pieces;
        self.bits.iter().enumerate().flat_map(move |(i, byte)| {
            (0..8).filter_map(move |position| {
                let piece = i * 8 + position as usize;
                if piece >= num_pieces {
                    return None;
                }
                let mask = 1u8.rotate_right(position + 1);
                (byte & mask != 0).then_some(piece)
            })
        })
    }

    /// Iterator over piece indices we still lack.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        let num_pieces = self.num_pieces;
        self.bits.iter().enumerate().flat_map(move |(i, byte)| {
            (0..8).filter_map(move |position| {
                let piece = i * 8 + position as usize;
                if piece >= num_pieces {
                    return None;
                }
                let mask = 1u8.rotate_right(position + 1);
                (byte & mask == 0).then_some(piece)
            })
        })
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.num_pieces
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::BitField;

    #[test]
    fn bitfield_has() {
        let data = [0b01110101, 0b01110001];
        let bitfield = BitField::from_bytes(&data, 16).unwrap();
        assert!(!bitfield.has(0));
        assert!(bitfield.has(1));
        assert!(bitfield.has(2));
        assert!(bitfield.has(3));
        assert!(!bitfield.has(4));
        assert!(bitfield.has(5));
        assert!(!bitfield.has(6));
        assert!(bitfield.has(7));
        assert!(!bitfield.has(8));
        assert!(bitfield.has(9));
        assert!(bitfield.has(10));
        assert!(bitfield.has(11));
        assert!(!bitfield.has(12));
        assert!(!bitfield.has(13));
        assert!(!bitfield.has(14));
        assert!(bitfield.has(15));
        assert!(!bitfield.has(16));
    }

    #[test]
    fn bitfield_add_remove() {
        let mut bitfield = BitField::empty(18);
        bitfield.add(0).unwrap();
        bitfield.add(9).unwrap();
        bitfield.add(17).unwrap();
        assert!(bitfield.add(18).is_err());
        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(9));
        assert!(bitfield.has(17));
        assert_eq!(bitfield.count(), 3);
        bitfield.remove(9).unwrap();
        assert!(!bitfield.has(9));
        assert!(bitfield.remove(20).is_err());
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn bitfield_iterators() {
        let data = [0b01110101, 0b01110001];
        let bitfield = BitField::from_bytes(&data, 16).unwrap();
        let pieces: Vec<_> = bitfield.pieces().collect();
        assert_eq!(pieces, vec![1, 2, 3, 5, 7, 9, 10, 11, 15]);
        let missing: Vec<_> = bitfield.missing().collect();
        assert_eq!(missing, vec![0, 4, 6, 8, 12, 13, 14]);
    }

    #[test]
    fn bitfield_from_bytes_validates() {
        let data = [0b01110101, 0b01110001];
        assert!(BitField::from_bytes(&data, 20).is_err());
        assert!(BitField::from_bytes(&data, 8).is_err());
        // piece 15 is set, so anything shorter than 16 must fail
        assert!(BitField::from_bytes(&data, 15).is_err());
        assert!(BitField::from_bytes(&data, 16).is_ok());
        let data = [0b11111111, 0b00000000];
        assert!(BitField::from_bytes(&data, 8).is_err());
        assert!(BitField::from_bytes(&data, 9).is_ok());
    }

    #[test]
    fn bitfield_full() {
        let bitfield = BitField::full(11);
        assert!(bitfield.is_full());
        assert_eq!(bitfield.count(), 11);
        assert_eq!(bitfield.pieces().count(), 11);
        assert!(!bitfield.has(11));
        let mut bitfield = BitField::full(8);
        bitfield.remove(3).unwrap();
        assert!(!bitfield.is_full());
    }
}
