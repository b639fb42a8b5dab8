//! Incremental two-phase rescaler used when the sink requests scaling.
//!
//! Rows are imported one at a time and zero or more output rows become exportable after each
//! import. Shrinking uses exact integer area averaging; expansion uses endpoint-aligned linear
//! interpolation. All arithmetic is per interleaved byte channel on BGRA rows.

const NUM_CHANNELS: usize = 4;

pub(crate) struct Rescaler {
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
    x_expand: bool,
    y_expand: bool,
    /// Current input row, x-scaled to numerators over `x_den()`.
    frow: Vec<u64>,
    /// Previous x-scaled input row (expansion) or the vertical accumulator (shrinking).
    irow: Vec<u64>,
    /// A completed accumulator row awaiting export (shrinking only).
    export_row_accum: Vec<u64>,
    /// Vertical span units still unfilled in the accumulator (shrinking only).
    v_remaining: u64,
    rows_in: usize,
    rows_out: usize,
    pending: bool,
    scaled_row: Vec<u8>,
}

impl Rescaler {
    pub fn new(src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> Self {
        let (src_width, src_height) = (src_width as usize, src_height as usize);
        let (dst_width, dst_height) = (dst_width as usize, dst_height as usize);
        Self {
            src_width,
            src_height,
            dst_width,
            dst_height,
            x_expand: src_width < dst_width,
            y_expand: src_height < dst_height,
            frow: vec![0; NUM_CHANNELS * dst_width],
            irow: vec![0; NUM_CHANNELS * dst_width],
            export_row_accum: vec![0; NUM_CHANNELS * dst_width],
            v_remaining: src_height as u64,
            rows_in: 0,
            rows_out: 0,
            pending: false,
            scaled_row: vec![0; NUM_CHANNELS * dst_width],
        }
    }

    /// Consume one source row of `src_width` BGRA pixels.
    ///
    /// The caller must drain pending output rows between imports.
    pub fn import_row(&mut self, row: &[u32]) {
        debug_assert_eq!(row.len(), self.src_width);
        debug_assert!(!self.pending);

        if self.y_expand {
            std::mem::swap(&mut self.irow, &mut self.frow);
            self.scale_row_x(row);
            self.rows_in += 1;
            return;
        }

        self.scale_row_x(row);
        self.rows_in += 1;
        // Distribute this row's vertical weight over the accumulator, completing at most one
        // output row.
        let mut weight = self.dst_height as u64;
        if weight >= self.v_remaining {
            let take = self.v_remaining;
            for (accum, &value) in self.irow.iter_mut().zip(&self.frow) {
                *accum += take * value;
            }
            std::mem::swap(&mut self.export_row_accum, &mut self.irow);
            self.pending = true;
            weight -= take;
            for (accum, &value) in self.irow.iter_mut().zip(&self.frow) {
                *accum = weight * value;
            }
            self.v_remaining = self.src_height as u64 - weight;
        } else {
            for (accum, &value) in self.irow.iter_mut().zip(&self.frow) {
                *accum += weight * value;
            }
            self.v_remaining -= weight;
        }
    }

    pub fn has_pending_output(&self) -> bool {
        if self.y_expand {
            self.rows_out < self.dst_height && {
                let (span, fraction) = self.v_position(self.rows_out);
                let needed = if fraction == 0 { span } else { span + 1 };
                needed < self.rows_in
            }
        } else {
            self.pending
        }
    }

    /// Produce the next scaled BGRA output row.
    pub fn export_row(&mut self) -> &[u8] {
        debug_assert!(self.has_pending_output());
        let den = self.x_den() * self.y_den();
        if self.y_expand {
            let (span, fraction) = self.v_position(self.rows_out);
            let fy = self.y_den();
            for (out, (&prev, &cur)) in self.scaled_row.iter_mut().zip(self.irow.iter().zip(&self.frow)) {
                let numerator = if fraction == 0 {
                    // An exactly aligned row: `span` is either the current or the previous import.
                    let value = if span + 1 == self.rows_in { cur } else { prev };
                    value * fy
                } else {
                    prev * (fy - fraction) + cur * fraction
                };
                *out = round_div(numerator, den);
            }
        } else {
            for (out, &accum) in self.scaled_row.iter_mut().zip(&self.export_row_accum) {
                *out = round_div(accum, den);
            }
            self.pending = false;
        }
        self.rows_out += 1;
        &self.scaled_row
    }

    /// Numerator denominator introduced by the horizontal pass.
    fn x_den(&self) -> u64 {
        if self.x_expand {
            (self.dst_width - 1).max(1) as u64
        } else {
            self.src_width as u64
        }
    }

    fn y_den(&self) -> u64 {
        if self.y_expand {
            (self.dst_height - 1) as u64
        } else {
            self.src_height as u64
        }
    }

    /// Source row span and interpolation fraction for expanded output row `row`.
    fn v_position(&self, row: usize) -> (usize, u64) {
        let position = (row * (self.src_height - 1)) as u64;
        let den = self.y_den();
        ((position / den) as usize, position % den)
    }

    fn scale_row_x(&mut self, row: &[u32]) {
        if self.x_expand {
            let den = self.x_den();
            for x_out in 0..self.dst_width {
                let position = (x_out * (self.src_width - 1)) as u64;
                let (x_in, fraction) = ((position / den) as usize, position % den);
                for channel in 0..NUM_CHANNELS {
                    let left = u64::from(channel_of(row[x_in], channel));
                    let value = if fraction == 0 {
                        left * den
                    } else {
                        let right = u64::from(channel_of(row[x_in + 1], channel));
                        left * (den - fraction) + right * fraction
                    };
                    self.frow[NUM_CHANNELS * x_out + channel] = value;
                }
            }
        } else {
            // Area averaging: each source pixel carries dst_width span units, each output pixel
            // absorbs src_width of them.
            for channel in 0..NUM_CHANNELS {
                let mut x_out = channel;
                let mut remaining = self.src_width as u64;
                let mut accum = 0u64;
                for &pixel in row {
                    let value = u64::from(channel_of(pixel, channel));
                    let mut weight = self.dst_width as u64;
                    while weight >= remaining {
                        self.frow[x_out] = accum + remaining * value;
                        x_out += NUM_CHANNELS;
                        weight -= remaining;
                        remaining = self.src_width as u64;
                        accum = 0;
                    }
                    accum += weight * value;
                    remaining -= weight;
                }
            }
        }
    }
}

fn channel_of(pixel: u32, channel: usize) -> u8 {
    (pixel >> (8 * channel)) as u8
}

fn round_div(numerator: u64, denominator: u64) -> u8 {
    ((numerator + denominator / 2) / denominator).min(255) as u8
}
